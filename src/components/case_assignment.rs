//! "Assign Case to Me" button
//!
//! Resolves the signed-in user's display name, mounts a floating trigger that
//! hides itself while the case is already assigned to that user, and runs the
//! assignment sequence (narrative note, status change, save) on click.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ConfigError;
use crate::dom::{Document, PageEvent, TriggerSpec};
use crate::engine::{
    AutomationSequence, AutomationStep, ElementPresent, NativeSetterCommitter, Orchestrator,
    PollPolicy, Poller, SequenceOutcome, StepAction, ValueEquals, VisibilityBinding,
    report_failure,
};

const CONTEXT: &str = "case assignment";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseAssignmentConfig {
    pub enabled: bool,

    /// Element whose text is the signed-in user's full name
    pub user_name_selector: String,
    pub user_name_poll: PollPolicy,

    pub trigger_id: String,
    pub trigger_label: String,

    /// Control holding the current assignee's abbreviated name
    pub assignee_selector: String,

    /// Subtree watched for re-renders
    pub observe_scope: String,

    pub add_narrative_selector: String,
    pub notes_selector: String,
    pub status_dropdown_selector: String,
    pub status_option_selector: String,
    pub save_selector: String,
    pub note_text: String,
    pub form_poll: PollPolicy,

    /// Wait between opening the status dropdown and picking the option.
    /// Nothing signals that the list has rendered, so this is a guess that
    /// slow sessions can outrun.
    pub dropdown_settle_ms: u64,

    /// Wait after the status change before saving, for the form state to
    /// catch up. Also a guess.
    pub submit_delay_ms: u64,
}

impl Default for CaseAssignmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_name_selector: "p.username".to_string(),
            user_name_poll: PollPolicy::new(20, 500),
            trigger_id: "assignCaseButton".to_string(),
            trigger_label: "Assign Case to Me".to_string(),
            assignee_selector: "input.MuiFilledInput-input".to_string(),
            observe_scope: "body".to_string(),
            add_narrative_selector: "button.MuiButton-outlinedSecondary".to_string(),
            notes_selector: r#"textarea[name="Notes"]"#.to_string(),
            status_dropdown_selector: r#"div.MuiFormControl-root:has(label[for="Status"]) div.MuiSelect-select[role="button"][aria-haspopup="listbox"]"#.to_string(),
            status_option_selector: r#"li.MuiMenuItem-root[data-value="Investigating"]"#
                .to_string(),
            save_selector: r#"button[aria-label="Save"]"#.to_string(),
            note_text: "Assigned and beginning investigation.".to_string(),
            form_poll: PollPolicy::new(20, 500),
            dropdown_settle_ms: 1000,
            submit_delay_ms: 500,
        }
    }
}

impl CaseAssignmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.user_name_poll.validate("case_assignment.user_name_poll")?;
        self.form_poll.validate("case_assignment.form_poll")?;
        if self.trigger_id.is_empty()
            || !self
                .trigger_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "case_assignment.trigger_id must be a plain element id, got '{}'",
                self.trigger_id
            )));
        }
        Ok(())
    }

    pub fn trigger(&self) -> TriggerSpec {
        TriggerSpec {
            id: self.trigger_id.clone(),
            label: self.trigger_label.clone(),
        }
    }

    /// Open the narrative form, fill the note, set the status, save
    pub fn sequence(&self) -> AutomationSequence {
        AutomationSequence::new(vec![
            AutomationStep {
                name: "Narrative form".to_string(),
                pre_action: Some(StepAction::Click {
                    selector: self.add_narrative_selector.clone(),
                    label: Some("Add Narrative button".to_string()),
                }),
                locate: vec![
                    self.notes_selector.clone(),
                    self.status_dropdown_selector.clone(),
                    self.save_selector.clone(),
                ],
                act: StepAction::Commit {
                    selector: self.notes_selector.clone(),
                    value: self.note_text.clone(),
                },
                post_delay_ms: 0,
                poll: self.form_poll,
            },
            AutomationStep {
                name: "Status dropdown".to_string(),
                pre_action: None,
                locate: vec![self.status_dropdown_selector.clone()],
                act: StepAction::SelectOption {
                    trigger: self.status_dropdown_selector.clone(),
                    option: self.status_option_selector.clone(),
                    settle_ms: self.dropdown_settle_ms,
                    label: None,
                },
                post_delay_ms: self.submit_delay_ms,
                poll: self.form_poll,
            },
            AutomationStep {
                name: "Save button".to_string(),
                pre_action: None,
                locate: vec![self.save_selector.clone()],
                act: StepAction::Click {
                    selector: self.save_selector.clone(),
                    label: None,
                },
                post_delay_ms: 0,
                poll: self.form_poll,
            },
        ])
    }
}

/// "Jane Smith" becomes "J. Smith". Needs at least two name parts.
pub fn abbreviate_name(full_name: &str) -> Option<String> {
    let mut parts = full_name.split_whitespace();
    let initial = parts.next()?.chars().next()?;
    let surname = parts.next()?;
    Some(format!("{initial}. {surname}"))
}

/// Running component. Dropping the handle leaves the task running; use
/// [`CaseAssignment::teardown`] to stop it.
pub struct CaseAssignment {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CaseAssignment {
    pub fn start(doc: Arc<dyn Document>, config: CaseAssignmentConfig) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(doc, config, cancel.clone()));
        Self { cancel, handle }
    }

    /// Stop listening, detach the observer and remove the trigger
    pub async fn teardown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Case assignment task ended abnormally: {}", e);
        }
    }
}

async fn run(doc: Arc<dyn Document>, config: CaseAssignmentConfig, cancel: CancellationToken) {
    let user_name = ElementPresent::new("User name element", config.user_name_selector.clone());
    let poller = Poller::new(config.user_name_poll);
    let found = tokio::select! {
        _ = cancel.cancelled() => return,
        found = poller.wait(doc.as_ref(), &user_name) => found,
    };
    let full_name = match found {
        Ok(element) => element.text.trim().to_string(),
        Err(e) => {
            report_failure(doc.as_ref(), CONTEXT, &e).await;
            return;
        }
    };
    let Some(abbreviation) = abbreviate_name(&full_name) else {
        error!(
            full_name = %full_name,
            selector = %config.user_name_selector,
            "Unable to parse user name, expected at least two parts"
        );
        return;
    };
    info!(abbreviation = %abbreviation, "Resolved signed-in user");

    let trigger = config.trigger();
    let mut events = doc.events();
    if let Err(e) = doc.mount_trigger(&trigger).await {
        error!(trigger = %trigger.id, "Failed to mount trigger: {}", e);
        return;
    }

    let hide_when = ValueEquals::new(
        "Case assignee",
        config.assignee_selector.clone(),
        abbreviation,
    );
    let binding = match VisibilityBinding::bind(
        doc.clone(),
        trigger.selector(),
        config.observe_scope.clone(),
        hide_when,
    )
    .await
    {
        Ok(binding) => Some(binding),
        Err(e) => {
            warn!(scope = %config.observe_scope, "Trigger visibility will not follow the page: {}", e);
            None
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(doc.clone(), Arc::new(NativeSetterCommitter)));
    let sequence = Arc::new(config.sequence());
    let running = Arc::new(tokio::sync::Mutex::new(()));

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(PageEvent::TriggerClicked { id }) if id == trigger.id => {
                let Ok(guard) = running.clone().try_lock_owned() else {
                    info!("Assignment already running, ignoring click");
                    continue;
                };
                let doc = doc.clone();
                let orchestrator = orchestrator.clone();
                let sequence = sequence.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    tokio::select! {
                        _ = cancel.cancelled() => debug!("Assignment run abandoned"),
                        outcome = orchestrator.run(&sequence) => match outcome {
                            SequenceOutcome::Completed => info!("Case assigned"),
                            SequenceOutcome::FailedAtStep { reason, .. } => {
                                report_failure(doc.as_ref(), CONTEXT, &reason).await;
                            }
                        },
                    }
                });
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Page events lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    if let Some(binding) = binding {
        binding.teardown().await;
    }
    if let Err(e) = doc.remove(&trigger.selector()).await {
        debug!(trigger = %trigger.id, "Trigger not removed: {}", e);
    }
    debug!("Case assignment stopped");
}
