//! Visibility binding
//!
//! Keeps a control hidden while a condition holds and shown otherwise. The
//! state is recomputed from scratch on every trigger: once at bind time, on
//! every mutation batch under the scope, and on history navigation. All
//! evaluations run one at a time on the watcher task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::readiness::Readiness;
use super::watcher::{MutationWatcher, Subscription};
use crate::dom::{Document, DomError, DomResult};

pub const HIDDEN_CLASS: &str = "hidden";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    /// Hidden exactly when the hide condition matched
    pub fn from_match(matched: bool) -> Self {
        if matched {
            Visibility::Hidden
        } else {
            Visibility::Visible
        }
    }

    pub fn is_hidden(self) -> bool {
        self == Visibility::Hidden
    }
}

async fn apply(doc: &dyn Document, target: &str, visibility: Visibility) {
    match doc
        .toggle_class(target, HIDDEN_CLASS, visibility.is_hidden())
        .await
    {
        Ok(true) => debug!(control = target, ?visibility, "Applied visibility"),
        Ok(false) => debug!(control = target, "Visibility target not in page"),
        Err(e) => warn!(control = target, "Failed to apply visibility: {}", e),
    }
}

/// Live binding between a hide condition and a target control
///
/// The observer stays attached until [`VisibilityBinding::teardown`].
pub struct VisibilityBinding {
    state: Arc<Mutex<Visibility>>,
    subscription: Subscription,
}

impl VisibilityBinding {
    /// Attach the watcher and return once the initial state is applied
    ///
    /// The initial check runs on the watcher task ahead of any mutation
    /// batch, so a later batch can never be overwritten by an older result.
    pub async fn bind<R>(
        doc: Arc<dyn Document>,
        target: impl Into<String>,
        scope: impl Into<String>,
        hide_when: R,
    ) -> DomResult<Self>
    where
        R: Readiness + 'static,
    {
        let target = target.into();
        let state = Arc::new(Mutex::new(Visibility::Visible));
        let (initial_tx, initial_rx) = oneshot::channel();
        let initial_tx = Arc::new(Mutex::new(Some(initial_tx)));

        let watched_doc = doc.clone();
        let watched_target = target.clone();
        let watched_state = state.clone();
        let subscription = MutationWatcher::new(scope, hide_when)
            .on_start(true)
            .on_navigation(true)
            .watch(doc, move |matched| {
                let doc = watched_doc.clone();
                let target = watched_target.clone();
                let state = watched_state.clone();
                let initial_tx = initial_tx.clone();
                async move {
                    let visibility = Visibility::from_match(matched.is_some());
                    let previous = std::mem::replace(&mut *state.lock(), visibility);
                    if previous != visibility {
                        info!(control = %target, ?visibility, "Visibility changed");
                    }
                    apply(doc.as_ref(), &target, visibility).await;
                    if let Some(tx) = initial_tx.lock().take() {
                        let _ = tx.send(visibility);
                    }
                }
            })
            .await?;

        let visibility = initial_rx.await.map_err(|_| {
            DomError::Bridge(format!("visibility watcher for {target} stopped before its first check"))
        })?;
        info!(control = %target, ?visibility, "Visibility bound");

        Ok(Self {
            state,
            subscription,
        })
    }

    pub fn current(&self) -> Visibility {
        *self.state.lock()
    }

    /// Detach the observer
    pub async fn teardown(self) {
        self.subscription.close().await;
    }
}
