//! Readiness poller
//!
//! Waits for a [`Readiness`] condition the host page produces on its own
//! schedule. The condition is evaluated immediately, then once per
//! `interval_ms`; the immediate evaluation is attempt 1, so a condition that
//! never holds is evaluated exactly `max_attempts` times and gives up
//! `(max_attempts - 1) * interval_ms` after the start.
//!
//! Two forms share that schedule:
//! - [`Poller::wait`], awaited inline by the step orchestrator
//! - [`WatchTask`], a spawned task with one-shot callbacks, which can also
//!   re-check on every mutation batch under a scope element

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::EngineError;
use super::policy::PollPolicy;
use super::readiness::Readiness;
use crate::dom::{Document, PageEvent};

/// Shortest tick; `tokio::time::interval` panics on a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

fn ticker(policy: PollPolicy) -> Interval {
    let mut ticker = tokio::time::interval(policy.interval().max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// One evaluation. Errors count as "not yet": a single failing read must not
/// end the wait.
async fn evaluate<R: Readiness + ?Sized>(
    doc: &dyn Document,
    condition: &R,
    attempt: u32,
) -> Option<R::Output> {
    match condition.check(doc).await {
        Ok(Some(found)) => {
            debug!(check = condition.label(), attempt, "Readiness condition satisfied");
            Some(found)
        }
        Ok(None) => {
            debug!(check = condition.label(), attempt, "Readiness condition not yet satisfied");
            None
        }
        Err(e) => {
            warn!(
                check = condition.label(),
                selector = %condition.selector(),
                attempt,
                "Readiness check failed, treating as not ready: {}",
                e
            );
            None
        }
    }
}

fn not_found<R: Readiness + ?Sized>(condition: &R, attempts: u32) -> EngineError {
    EngineError::ElementNotFound {
        check: condition.label().to_string(),
        selector: condition.selector(),
        attempts,
    }
}

/// Inline bounded wait
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    policy: PollPolicy,
}

impl Poller {
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    /// Fail with [`EngineError::InvalidPolicy`] when the policy cannot
    /// describe a bounded wait
    pub fn ensure_valid<R: Readiness + ?Sized>(&self, condition: &R) -> Result<(), EngineError> {
        self.policy
            .check_bounds()
            .map_err(|reason| EngineError::InvalidPolicy {
                check: condition.label().to_string(),
                selector: condition.selector(),
                reason,
            })
    }

    /// Wait for `condition`, or fail with [`EngineError::ElementNotFound`]
    pub async fn wait<R: Readiness + ?Sized>(
        &self,
        doc: &dyn Document,
        condition: &R,
    ) -> Result<R::Output, EngineError> {
        self.ensure_valid(condition)?;
        let mut ticker = ticker(self.policy);
        for attempt in 1..=self.policy.max_attempts {
            ticker.tick().await;
            if let Some(found) = evaluate(doc, condition, attempt).await {
                return Ok(found);
            }
        }
        Err(not_found(condition, self.policy.max_attempts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Pending,
    Satisfied,
    TimedOut,
    /// Owner lost interest before resolution; no callback ran
    Cancelled,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WatchState::Pending)
    }
}

enum Resolution<T> {
    Satisfied(T),
    TimedOut,
    Cancelled,
}

type SatisfiedFn<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, ()> + Send>;
type TimeoutFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct WatchTaskBuilder<R: Readiness> {
    condition: R,
    policy: PollPolicy,
    observe: Option<String>,
    parent: Option<CancellationToken>,
    on_satisfied: Option<SatisfiedFn<R::Output>>,
    on_timeout: Option<TimeoutFn>,
}

impl<R: Readiness + 'static> WatchTaskBuilder<R> {
    pub fn policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Also re-check on every mutation batch under `scope`. These checks do
    /// not consume attempts.
    pub fn observe(mut self, scope: impl Into<String>) -> Self {
        self.observe = Some(scope.into());
        self
    }

    /// Cancel the task when `token` is cancelled
    pub fn cancelled_by(mut self, token: &CancellationToken) -> Self {
        self.parent = Some(token.clone());
        self
    }

    pub fn on_satisfied<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce(R::Output) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_satisfied = Some(Box::new(move |found| callback(found).boxed()));
        self
    }

    pub fn on_timeout<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_timeout = Some(Box::new(move || callback().boxed()));
        self
    }

    /// Start the task. A policy with no attempts still evaluates once, and a
    /// zero interval ticks every millisecond.
    pub fn spawn(mut self, doc: Arc<dyn Document>) -> WatchTask {
        if let Err(reason) = self.policy.check_bounds() {
            warn!(check = self.condition.label(), "Questionable poll policy: {}", reason);
        }
        let state = Arc::new(Mutex::new(WatchState::Pending));
        let cancel = match self.parent.take() {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let handle = tokio::spawn(run(self, doc, state.clone(), cancel.clone()));
        WatchTask {
            state,
            cancel,
            handle,
        }
    }
}

/// A pending wait with exactly one terminal callback
///
/// The timer and the observer (if any) are released on the first terminal
/// transition, before the callback runs.
pub struct WatchTask {
    state: Arc<Mutex<WatchState>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WatchTask {
    pub fn builder<R: Readiness + 'static>(condition: R) -> WatchTaskBuilder<R> {
        WatchTaskBuilder {
            condition,
            policy: PollPolicy::default(),
            observe: None,
            parent: None,
            on_satisfied: None,
            on_timeout: None,
        }
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock()
    }

    /// Stop waiting. No-op once terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the task has resolved and its callback has returned
    pub async fn finished(self) -> WatchState {
        if let Err(e) = self.handle.await {
            warn!("Watch task ended abnormally: {}", e);
        }
        *self.state.lock()
    }
}

async fn run<R: Readiness + 'static>(
    task: WatchTaskBuilder<R>,
    doc: Arc<dyn Document>,
    state: Arc<Mutex<WatchState>>,
    cancel: CancellationToken,
) {
    let WatchTaskBuilder {
        condition,
        policy,
        observe,
        on_satisfied,
        on_timeout,
        ..
    } = task;

    let mut events = doc.events();
    let observer = match &observe {
        Some(scope) => match doc.observe(scope).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(check = condition.label(), scope = %scope, "Falling back to polling only: {}", e);
                None
            }
        },
        None => None,
    };
    let mut listening = observer.is_some();
    let mut ticker = ticker(policy);
    let mut attempts = 0u32;

    let resolution = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Resolution::Cancelled,
            _ = ticker.tick() => {
                attempts += 1;
                if let Some(found) = evaluate(doc.as_ref(), &condition, attempts).await {
                    break Resolution::Satisfied(found);
                }
                if attempts >= policy.max_attempts {
                    break Resolution::TimedOut;
                }
            }
            received = events.recv(), if listening => match received {
                Ok(PageEvent::Mutations { observer: id, .. }) if Some(id) == observer => {
                    if let Some(found) = evaluate(doc.as_ref(), &condition, attempts).await {
                        break Resolution::Satisfied(found);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(check = condition.label(), skipped, "Page events lagged, re-checking once");
                    if let Some(found) = evaluate(doc.as_ref(), &condition, attempts).await {
                        break Resolution::Satisfied(found);
                    }
                }
                Err(RecvError::Closed) => listening = false,
            },
        }
    };

    if let Some(id) = observer
        && let Err(e) = doc.disconnect(id).await
    {
        warn!(check = condition.label(), "Failed to disconnect observer: {}", e);
    }

    match resolution {
        Resolution::Satisfied(found) => {
            *state.lock() = WatchState::Satisfied;
            info!(check = condition.label(), attempts, "Watch satisfied");
            if let Some(callback) = on_satisfied {
                callback(found).await;
            }
        }
        Resolution::TimedOut => {
            *state.lock() = WatchState::TimedOut;
            warn!(
                check = condition.label(),
                selector = %condition.selector(),
                attempts,
                "Watch timed out"
            );
            if let Some(callback) = on_timeout {
                callback().await;
            }
        }
        Resolution::Cancelled => {
            *state.lock() = WatchState::Cancelled;
            debug!(check = condition.label(), "Watch cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fake::{FakeDocument, FakeElement};
    use crate::engine::readiness::ElementPresent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const CASE_URL: &str = "https://portal.test/apps/case/42";

    fn document() -> Arc<FakeDocument> {
        let doc = Arc::new(FakeDocument::new(CASE_URL));
        doc.insert("body", FakeElement::new("body"));
        doc
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_immediately_when_present() {
        let doc = document();
        doc.insert("p.username", FakeElement::new("p").text("Jane Smith"));
        let start = Instant::now();

        let found = Poller::new(PollPolicy::new(20, 500))
            .wait(doc.as_ref(), &ElementPresent::new("User name element", "p.username"))
            .await
            .unwrap();

        assert_eq!(found.text, "Jane Smith");
        assert_eq!(doc.query_count("p.username"), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn never_matching_wait_is_bounded() {
        let doc = document();
        let start = Instant::now();

        let error = Poller::new(PollPolicy::new(5, 100))
            .wait(doc.as_ref(), &ElementPresent::new("Missing", "#missing"))
            .await
            .unwrap_err();

        assert!(matches!(error, EngineError::ElementNotFound { attempts: 5, .. }));
        assert_eq!(doc.query_count("#missing"), 5);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_an_error_not_a_panic() {
        let doc = document();

        let error = Poller::new(PollPolicy::new(5, 0))
            .wait(doc.as_ref(), &ElementPresent::new("Missing", "#missing"))
            .await
            .unwrap_err();

        assert!(matches!(error, EngineError::InvalidPolicy { .. }));
        assert_eq!(error.selector(), "#missing");
        assert_eq!(doc.query_count("#missing"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_task_tolerates_degenerate_policy() {
        let doc = document();
        let timeouts = Arc::new(AtomicUsize::new(0));

        let counter = timeouts.clone();
        let task = WatchTask::builder(ElementPresent::new("Client name", "p.client"))
            .policy(PollPolicy::new(0, 0))
            .on_timeout(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(doc.clone());

        assert_eq!(task.finished().await, WatchState::TimedOut);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(doc.query_count("p.client"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_callback_after_bounded_evaluations() {
        let doc = document();
        let fired = Arc::new(Mutex::new(None));
        let start = Instant::now();

        let slot = fired.clone();
        let task = WatchTask::builder(ElementPresent::new("Client name", "p.client"))
            .policy(PollPolicy::new(8, 250))
            .on_timeout(move || async move {
                *slot.lock() = Some(Instant::now());
            })
            .spawn(doc.clone());

        assert_eq!(task.finished().await, WatchState::TimedOut);
        let at = fired.lock().take().expect("timeout callback ran");
        assert!(at - start >= Duration::from_millis(7 * 250));
        assert!(doc.query_count("p.client") <= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_reads_still_time_out() {
        let doc = document();
        doc.fail_queries("p.client");
        let timeouts = Arc::new(AtomicUsize::new(0));

        let counter = timeouts.clone();
        let task = WatchTask::builder(ElementPresent::new("Client name", "p.client"))
            .policy(PollPolicy::new(4, 100))
            .on_timeout(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(doc.clone());

        assert_eq!(task.finished().await, WatchState::TimedOut);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(doc.query_count("p.client"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_batch_satisfies_before_next_tick() {
        let doc = document();
        let start = Instant::now();

        let task = WatchTask::builder(ElementPresent::new("Client name", "p.client"))
            .policy(PollPolicy::new(80, 250))
            .observe("body")
            .spawn(doc.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        doc.insert("p.client", FakeElement::new("p").text("Acme"));
        doc.mutate(3);

        assert_eq!(task.finished().await, WatchState::Satisfied);
        assert!(start.elapsed() < Duration::from_millis(250));
        assert_eq!(doc.query_count("p.client"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_callback_fires_once_despite_later_mutations() {
        let doc = document();
        doc.insert("p.client", FakeElement::new("p").text("Acme"));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let task = WatchTask::builder(ElementPresent::new("Client name", "p.client"))
            .policy(PollPolicy::new(80, 250))
            .observe("body")
            .on_satisfied(move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(doc.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            doc.mutate(10);
        }
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(task.finished().await, WatchState::Satisfied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(doc.live_observers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_runs_no_callback() {
        let doc = document();
        let calls = Arc::new(AtomicUsize::new(0));

        let on_found = calls.clone();
        let on_timeout = calls.clone();
        let task = WatchTask::builder(ElementPresent::new("Client name", "p.client"))
            .policy(PollPolicy::new(80, 250))
            .observe("body")
            .on_satisfied(move |_| async move {
                on_found.fetch_add(1, Ordering::SeqCst);
            })
            .on_timeout(move || async move {
                on_timeout.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(doc.clone());

        tokio::time::sleep(Duration::from_millis(600)).await;
        task.cancel();

        assert_eq!(task.finished().await, WatchState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(doc.live_observers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_token_cancels_task() {
        let doc = document();
        let parent = CancellationToken::new();
        let task = WatchTask::builder(ElementPresent::new("Client name", "p.client"))
            .policy(PollPolicy::new(80, 250))
            .cancelled_by(&parent)
            .spawn(doc.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        parent.cancel();

        assert_eq!(task.finished().await, WatchState::Cancelled);
        assert_eq!(doc.query_count("p.client"), 2);
    }
}
