use thiserror::Error;

use crate::dom::DomError;

/// Why one automation run stopped
///
/// Every variant is local to a single run. The component that hit it keeps
/// running and the user can retry.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{check} not found after {attempts} attempts (selector: {selector})")]
    ElementNotFound {
        check: String,
        selector: String,
        attempts: u32,
    },

    #[error("Cannot commit a value to '{selector}': {reason}")]
    InjectionUnsupported { selector: String, reason: String },

    #[error("Option '{selector}' was not rendered {settle_ms}ms after opening the dropdown")]
    TransientOptionMissing { selector: String, settle_ms: u64 },

    #[error("Wait for {check} has an unusable poll policy: {reason} (selector: {selector})")]
    InvalidPolicy {
        check: String,
        selector: String,
        reason: String,
    },

    #[error("Page interaction on '{selector}' failed: {source}")]
    Dom {
        selector: String,
        #[source]
        source: DomError,
    },
}

impl EngineError {
    pub(crate) fn dom(selector: &str, source: DomError) -> Self {
        EngineError::Dom {
            selector: selector.to_string(),
            source,
        }
    }

    /// Selector the failing check or action used
    pub fn selector(&self) -> &str {
        match self {
            EngineError::ElementNotFound { selector, .. }
            | EngineError::InjectionUnsupported { selector, .. }
            | EngineError::TransientOptionMissing { selector, .. }
            | EngineError::InvalidPolicy { selector, .. }
            | EngineError::Dom { selector, .. } => selector,
        }
    }

    /// Short kind name for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ElementNotFound { .. } => "element_not_found",
            EngineError::InjectionUnsupported { .. } => "injection_unsupported",
            EngineError::TransientOptionMissing { .. } => "transient_option_missing",
            EngineError::InvalidPolicy { .. } => "invalid_policy",
            EngineError::Dom { .. } => "dom",
        }
    }

    /// Text shown to the user in the page alert
    pub fn alert_message(&self) -> String {
        match self {
            EngineError::ElementNotFound { check, .. } => {
                format!("Error: {check} not found.")
            }
            EngineError::InjectionUnsupported { .. } => {
                "Error: this page does not allow setting the field value.".to_string()
            }
            EngineError::TransientOptionMissing { selector, .. } => {
                format!("Error: option {selector} not found in dropdown.")
            }
            EngineError::InvalidPolicy { check, reason, .. } => {
                format!("Error: cannot wait for {check}: {reason}.")
            }
            EngineError::Dom { .. } => format!("Error: {self}"),
        }
    }
}
