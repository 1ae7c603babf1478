//! Synthetic input injection
//!
//! Reactive UI frameworks install a per-instance `value` accessor and track
//! the last value they saw. Assigning through that accessor updates the
//! tracker too, so the framework never notices a change and submits its
//! stale model. Writing through the prototype setter leaves the tracker
//! behind; the `input`/`change` events that follow make the framework
//! compare, see the difference and adopt the new value.

use async_trait::async_trait;
use tracing::{debug, info};

use super::error::EngineError;
use crate::dom::{Document, DomError, EventKind};

/// Event sequence after the write. `blur` before `change` lets some
/// frameworks revert the field.
pub const COMMIT_EVENTS: [EventKind; 4] = [
    EventKind::Input,
    EventKind::Change,
    EventKind::Focus,
    EventKind::Blur,
];

/// Commit a value change to a possibly framework-controlled control
#[async_trait]
pub trait ValueCommitter: Send + Sync {
    async fn commit(&self, doc: &dyn Document, selector: &str, value: &str) -> Result<(), EngineError>;
}

/// Prototype-setter write followed by [`COMMIT_EVENTS`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSetterCommitter;

#[async_trait]
impl ValueCommitter for NativeSetterCommitter {
    async fn commit(&self, doc: &dyn Document, selector: &str, value: &str) -> Result<(), EngineError> {
        let vanished = || EngineError::ElementNotFound {
            check: "Form field".to_string(),
            selector: selector.to_string(),
            attempts: 1,
        };

        match doc.write_native_value(selector, value).await {
            Ok(true) => {}
            Ok(false) => return Err(vanished()),
            Err(DomError::SetterUnavailable { selector, reason }) => {
                return Err(EngineError::InjectionUnsupported { selector, reason });
            }
            Err(e) => return Err(EngineError::dom(selector, e)),
        }

        for event in COMMIT_EVENTS {
            let delivered = doc
                .dispatch(selector, event)
                .await
                .map_err(|e| EngineError::dom(selector, e))?;
            if !delivered {
                return Err(vanished());
            }
            debug!(selector, event = event.name(), "Dispatched synthetic event");
        }

        info!(selector, chars = value.chars().count(), "Committed field value");
        Ok(())
    }
}

/// Commit `value` with the default [`NativeSetterCommitter`]
pub async fn set_controlled_value(
    doc: &dyn Document,
    selector: &str,
    value: &str,
) -> Result<(), EngineError> {
    NativeSetterCommitter.commit(doc, selector, value).await
}
