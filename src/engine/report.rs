use tracing::{error, warn};

use super::error::EngineError;
use crate::dom::Document;

/// Surface a run failure: one blocking page alert and one error log line
/// carrying the check's selector
pub async fn report_failure(doc: &dyn Document, context: &str, failure: &EngineError) {
    error!(
        context,
        kind = failure.kind(),
        selector = %failure.selector(),
        "{}",
        failure
    );
    if let Err(e) = doc.alert(&failure.alert_message()).await {
        warn!(context, "Failed to show failure alert: {}", e);
    }
}
