//! Step orchestrator
//!
//! Runs an [`AutomationSequence`] one step at a time: optional pre-action,
//! bounded wait for the step's controls, the action itself, then a settle
//! delay. The first failure ends the run. Nothing is rolled back; a sub-form
//! opened by an earlier step stays open for the user to deal with.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::EngineError;
use super::injector::ValueCommitter;
use super::policy::PollPolicy;
use super::poller::Poller;
use super::readiness::AllPresent;
use crate::dom::{Document, EventKind};

fn default_open_settle_ms() -> u64 {
    1000
}

/// Side effect applied by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Bubbling synthetic click
    Click {
        selector: String,
        /// Names the control in a not-found failure instead of the step
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// Framework-aware value write through the [`ValueCommitter`]
    Commit { selector: String, value: String },

    /// Open a popup list with mousedown+mouseup on `trigger`, wait
    /// `settle_ms` for it to render, then click `option`
    SelectOption {
        trigger: String,
        option: String,
        #[serde(default = "default_open_settle_ms")]
        settle_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl StepAction {
    pub fn selector(&self) -> &str {
        match self {
            StepAction::Click { selector, .. } | StepAction::Commit { selector, .. } => selector,
            StepAction::SelectOption { trigger, .. } => trigger,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            StepAction::Click { label, .. } | StepAction::SelectOption { label, .. } => {
                label.as_deref()
            }
            StepAction::Commit { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationStep {
    pub name: String,

    /// Applied before waiting, e.g. the click that opens a sub-form
    #[serde(default)]
    pub pre_action: Option<StepAction>,

    /// Selectors that must all be present before `act`
    #[serde(default)]
    pub locate: Vec<String>,

    pub act: StepAction,

    /// Fixed wait after `act` for re-render latency nothing signals
    #[serde(default)]
    pub post_delay_ms: u64,

    #[serde(default)]
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationSequence {
    pub steps: Vec<AutomationStep>,
}

impl AutomationSequence {
    pub fn new(steps: Vec<AutomationStep>) -> Self {
        Self { steps }
    }
}

#[derive(Debug)]
pub enum SequenceOutcome {
    Completed,
    FailedAtStep {
        index: usize,
        step: String,
        reason: EngineError,
    },
}

impl SequenceOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SequenceOutcome::Completed)
    }
}

pub struct Orchestrator {
    doc: Arc<dyn Document>,
    committer: Arc<dyn ValueCommitter>,
}

impl Orchestrator {
    pub fn new(doc: Arc<dyn Document>, committer: Arc<dyn ValueCommitter>) -> Self {
        Self { doc, committer }
    }

    pub async fn run(&self, sequence: &AutomationSequence) -> SequenceOutcome {
        info!(steps = sequence.steps.len(), "Starting automation sequence");
        for (index, step) in sequence.steps.iter().enumerate() {
            if let Err(reason) = self.run_step(step).await {
                warn!(
                    index,
                    step = %step.name,
                    kind = reason.kind(),
                    selector = %reason.selector(),
                    "Automation step failed: {}",
                    reason
                );
                return SequenceOutcome::FailedAtStep {
                    index,
                    step: step.name.clone(),
                    reason,
                };
            }
        }
        info!("Automation sequence completed");
        SequenceOutcome::Completed
    }

    async fn run_step(&self, step: &AutomationStep) -> Result<(), EngineError> {
        debug!(step = %step.name, "Running step");
        let poller = Poller::new(step.poll);
        let locate = (!step.locate.is_empty())
            .then(|| AllPresent::new(step.name.clone(), step.locate.clone()));
        // Before the pre-action, so a bad policy leaves the page untouched
        if let Some(condition) = &locate {
            poller.ensure_valid(condition)?;
        }

        if let Some(pre_action) = &step.pre_action {
            self.apply(pre_action, &step.name).await?;
        }

        if let Some(condition) = &locate {
            poller.wait(self.doc.as_ref(), condition).await?;
        }

        self.apply(&step.act, &step.name).await?;

        if step.post_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.post_delay_ms)).await;
        }
        Ok(())
    }

    /// A not-found failure names the action's label, else `step`
    async fn apply(&self, action: &StepAction, step: &str) -> Result<(), EngineError> {
        let check = action.label().unwrap_or(step);
        match action {
            StepAction::Click { selector, .. } => self.click(selector, check).await,
            StepAction::Commit { selector, value } => {
                self.committer.commit(self.doc.as_ref(), selector, value).await
            }
            StepAction::SelectOption {
                trigger,
                option,
                settle_ms,
                ..
            } => {
                for event in [EventKind::MouseDown, EventKind::MouseUp] {
                    if !self.send(trigger, event).await? {
                        return Err(EngineError::ElementNotFound {
                            check: check.to_string(),
                            selector: trigger.clone(),
                            attempts: 1,
                        });
                    }
                }
                debug!(trigger = %trigger, settle_ms, "Dropdown opened");

                // Popup rendering has no observable completion signal
                tokio::time::sleep(Duration::from_millis(*settle_ms)).await;

                let missing = || EngineError::TransientOptionMissing {
                    selector: option.clone(),
                    settle_ms: *settle_ms,
                };
                let present = self
                    .doc
                    .query(option)
                    .await
                    .map_err(|e| EngineError::dom(option, e))?;
                if present.is_none() || !self.send(option, EventKind::Click).await? {
                    return Err(missing());
                }
                info!(option = %option, "Dropdown option selected");
                Ok(())
            }
        }
    }

    async fn click(&self, selector: &str, check: &str) -> Result<(), EngineError> {
        if self.send(selector, EventKind::Click).await? {
            info!(selector, "Clicked");
            Ok(())
        } else {
            Err(EngineError::ElementNotFound {
                check: check.to_string(),
                selector: selector.to_string(),
                attempts: 1,
            })
        }
    }

    async fn send(&self, selector: &str, event: EventKind) -> Result<bool, EngineError> {
        self.doc
            .dispatch(selector, event)
            .await
            .map_err(|e| EngineError::dom(selector, e))
    }
}
