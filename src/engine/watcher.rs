//! Mutation watcher
//!
//! A standing, non-terminating detector: every mutation batch under the
//! scope element re-runs the condition once and hands the result (matched or
//! not) to the callback. The page reports one event per observer callback
//! invocation, and events already queued when an evaluation starts are folded
//! into it, so a burst costs one evaluation.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::readiness::Readiness;
use crate::dom::{Document, DomResult, PageEvent};

/// What re-runs the condition besides the mutation batches themselves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Triggers {
    /// History navigation (`popstate`). Some single-page transitions swap
    /// the page without any mutation under the scope.
    pub navigation: bool,

    /// One check as soon as the observer is attached, ahead of any batch
    pub start: bool,
}

/// Discard events queued behind the one being handled. The evaluation about
/// to run sees the page after all of them.
fn drain_queued(events: &mut broadcast::Receiver<PageEvent>) -> u64 {
    let mut drained = 0;
    loop {
        match events.try_recv() {
            Ok(_) => drained += 1,
            Err(TryRecvError::Lagged(skipped)) => drained += skipped,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
        }
    }
}

async fn evaluate<R: Readiness>(doc: &dyn Document, condition: &R) -> Option<R::Output> {
    match condition.check(doc).await {
        Ok(result) => result,
        Err(e) => {
            warn!(
                check = condition.label(),
                selector = %condition.selector(),
                "Watch check failed, treating as unmatched: {}",
                e
            );
            None
        }
    }
}

pub struct MutationWatcher<R> {
    scope: String,
    condition: R,
    triggers: Triggers,
}

impl<R: Readiness + 'static> MutationWatcher<R> {
    pub fn new(scope: impl Into<String>, condition: R) -> Self {
        Self {
            scope: scope.into(),
            condition,
            triggers: Triggers::default(),
        }
    }

    pub fn on_navigation(mut self, enabled: bool) -> Self {
        self.triggers.navigation = enabled;
        self
    }

    pub fn on_start(mut self, enabled: bool) -> Self {
        self.triggers.start = enabled;
        self
    }

    /// Attach the observer and start delivering results to `callback`
    ///
    /// Fails only if the observer cannot be attached.
    pub async fn watch<F, Fut>(self, doc: Arc<dyn Document>, mut callback: F) -> DomResult<Subscription>
    where
        F: FnMut(Option<R::Output>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut events = doc.events();
        let observer = doc.observe(&self.scope).await?;
        debug!(scope = %self.scope, check = self.condition.label(), "Mutation watcher attached");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let MutationWatcher {
            scope,
            condition,
            triggers,
        } = self;

        let handle = tokio::spawn(async move {
            if triggers.start {
                callback(evaluate(doc.as_ref(), &condition).await).await;
            }
            loop {
                let relevant = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(PageEvent::Mutations { observer: id, records }) if id == observer => {
                            debug!(scope = %scope, records, "Mutation batch");
                            true
                        }
                        Ok(PageEvent::Navigated) => triggers.navigation,
                        Ok(_) => false,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(scope = %scope, skipped, "Page events lagged, re-checking once");
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if !relevant {
                    continue;
                }
                let coalesced = drain_queued(&mut events);
                if coalesced > 0 {
                    debug!(scope = %scope, coalesced, "Folded queued page events into one check");
                }
                callback(evaluate(doc.as_ref(), &condition).await).await;
            }
            if let Err(e) = doc.disconnect(observer).await {
                warn!(scope = %scope, "Failed to disconnect observer: {}", e);
            }
            debug!(scope = %scope, "Mutation watcher detached");
        });

        Ok(Subscription { cancel, handle })
    }
}

/// Live watcher; [`Subscription::cancel`] detaches the observer
pub struct Subscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait until the observer is detached
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Mutation watcher ended abnormally: {}", e);
        }
    }
}
