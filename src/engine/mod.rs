//! Readiness and form-automation engine
//!
//! Building blocks, bottom-up:
//! - [`Readiness`] conditions over the current document
//! - [`Poller`] and [`WatchTask`] for bounded waits on them
//! - [`MutationWatcher`] for standing re-evaluation on page mutations
//! - [`ValueCommitter`] for writes a reactive framework will accept
//! - [`Orchestrator`] running an [`AutomationSequence`] step by step
//! - [`VisibilityBinding`] showing or hiding a control from a condition

mod error;
mod injector;
mod orchestrator;
mod policy;
mod poller;
mod readiness;
mod report;
mod visibility;
mod watcher;

pub use error::EngineError;
pub use injector::{COMMIT_EVENTS, NativeSetterCommitter, ValueCommitter, set_controlled_value};
pub use orchestrator::{AutomationSequence, AutomationStep, Orchestrator, SequenceOutcome, StepAction};
pub use policy::{MAX_POLL_WAIT_MS, PollPolicy};
pub use poller::{Poller, WatchState, WatchTask, WatchTaskBuilder};
pub use readiness::{AllPresent, ElementPresent, Readiness, ValueEquals};
pub use report::report_failure;
pub use visibility::{HIDDEN_CLASS, Visibility, VisibilityBinding};
pub use watcher::{MutationWatcher, Subscription, Triggers};
