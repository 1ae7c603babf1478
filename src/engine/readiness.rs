//! Readiness conditions: predicates over the current document
//!
//! A condition is evaluated fresh on every attempt and returns owned data, so
//! nothing it matched outlives the evaluation. Conditions must not change the
//! page; the poller may call them many times.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::dom::{Document, DomResult, ElementSnapshot};

#[async_trait]
pub trait Readiness: Send + Sync {
    type Output: Send + 'static;

    /// `Ok(Some(_))` when the condition holds right now
    async fn check(&self, doc: &dyn Document) -> DomResult<Option<Self::Output>>;

    /// Human name of what is being waited for, used in alerts
    fn label(&self) -> &str;

    /// Selector(s) behind the condition, used in diagnostics
    fn selector(&self) -> String;
}

/// An element matching `selector` exists
#[derive(Debug, Clone)]
pub struct ElementPresent {
    label: String,
    selector: String,
}

impl ElementPresent {
    pub fn new(label: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl Readiness for ElementPresent {
    type Output = ElementSnapshot;

    async fn check(&self, doc: &dyn Document) -> DomResult<Option<ElementSnapshot>> {
        doc.query(&self.selector).await
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn selector(&self) -> String {
        self.selector.clone()
    }
}

/// Every selector matches an element
///
/// After an unsuccessful check, [`Readiness::selector`] reports only the
/// selectors that were missing on that check.
#[derive(Debug)]
pub struct AllPresent {
    label: String,
    selectors: Vec<String>,
    missing: Mutex<Vec<String>>,
}

impl AllPresent {
    pub fn new(label: impl Into<String>, selectors: Vec<String>) -> Self {
        Self {
            label: label.into(),
            selectors,
            missing: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Readiness for AllPresent {
    type Output = Vec<ElementSnapshot>;

    async fn check(&self, doc: &dyn Document) -> DomResult<Option<Vec<ElementSnapshot>>> {
        let mut found = Vec::with_capacity(self.selectors.len());
        let mut missing = Vec::new();
        for selector in &self.selectors {
            match doc.query(selector).await? {
                Some(snapshot) => found.push(snapshot),
                None => missing.push(selector.clone()),
            }
        }
        let satisfied = missing.is_empty();
        *self.missing.lock() = missing;
        Ok(satisfied.then_some(found))
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn selector(&self) -> String {
        let missing = self.missing.lock();
        if missing.is_empty() {
            self.selectors.join(", ")
        } else {
            missing.join(", ")
        }
    }
}

/// A form control exists and its current value equals `expected`
#[derive(Debug, Clone)]
pub struct ValueEquals {
    label: String,
    selector: String,
    expected: String,
}

impl ValueEquals {
    pub fn new(
        label: impl Into<String>,
        selector: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            selector: selector.into(),
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl Readiness for ValueEquals {
    type Output = ElementSnapshot;

    async fn check(&self, doc: &dyn Document) -> DomResult<Option<ElementSnapshot>> {
        let snapshot = doc.query(&self.selector).await?;
        Ok(snapshot.filter(|s| s.value.as_deref() == Some(self.expected.as_str())))
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn selector(&self) -> String {
        self.selector.clone()
    }
}
