//! Page document capability
//!
//! Every component reaches the live page through [`Document`]. The CDP
//! implementation drives a chromiumoxide `Page`; tests run against an
//! in-memory document with the same observable behavior.
//!
//! Element handles never cross this boundary. Queries return owned
//! [`ElementSnapshot`]s and actions take a selector, so an element the host
//! framework re-rendered since the last call is simply found again (or not).

mod cdp;
#[cfg(test)]
pub(crate) mod fake;
mod script;

pub use cdp::CdpDocument;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum DomError {
    #[error("Script evaluation failed: {0}")]
    Evaluation(String),

    #[error("Unexpected script result: {0}")]
    Decode(String),

    #[error("No prototype value setter for '{selector}': {reason}")]
    SetterUnavailable { selector: String, reason: String },

    #[error("Observation scope not found: {0}")]
    ScopeNotFound(String),

    #[error("Page event bridge failed: {0}")]
    Bridge(String),
}

pub type DomResult<T> = Result<T, DomError>;

/// Owned view of an element at the moment it was queried
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    /// Lowercase tag name
    pub tag: String,

    /// `textContent`, untrimmed
    pub text: String,

    /// Current value for input, textarea and select elements
    #[serde(default)]
    pub value: Option<String>,
}

/// Synthetic events the engine dispatches. All of them bubble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Click,
    MouseDown,
    MouseUp,
    Input,
    Change,
    Focus,
    Blur,
}

impl EventKind {
    /// DOM event type name
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Click => "click",
            EventKind::MouseDown => "mousedown",
            EventKind::MouseUp => "mouseup",
            EventKind::Input => "input",
            EventKind::Change => "change",
            EventKind::Focus => "focus",
            EventKind::Blur => "blur",
        }
    }

    /// Mouse events are constructed as `MouseEvent`, the rest as plain `Event`
    pub fn is_mouse(self) -> bool {
        matches!(self, EventKind::Click | EventKind::MouseDown | EventKind::MouseUp)
    }
}

/// Handle to a mutation observer attached through [`Document::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

/// Something that happened in the page, delivered to every subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    /// One observer callback invocation, however many records it carried
    Mutations { observer: ObserverId, records: usize },

    /// `popstate` fired on the window
    Navigated,

    /// A new document finished parsing (`DOMContentLoaded`). Observers
    /// and mounted triggers of the previous document are gone.
    Loaded { url: String },

    /// A trigger mounted with [`Document::mount_trigger`] was clicked
    TriggerClicked { id: String },

    /// A right-click on text matching one of the menu's capture patterns.
    /// The page has already suppressed its own context menu.
    MenuRequested { menu: String, text: String },

    /// An item of a menu mounted with [`Document::mount_menu`] was clicked
    MenuItemClicked { menu: String, item: String },
}

/// Floating control injected into the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    pub id: String,
    pub label: String,
}

impl TriggerSpec {
    pub fn selector(&self) -> String {
        format!("#{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuItemSpec {
    pub id: String,
    pub label: String,
}

/// Where to read the right-clicked text when nothing is selected: the text
/// of `value` inside the closest `cell` ancestor of the click target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextFallback {
    pub cell: String,
    pub value: String,
}

/// Context menu injected into the page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuSpec {
    pub id: String,
    pub items: Vec<MenuItemSpec>,

    /// JavaScript regex sources. Only right-clicks whose text matches one
    /// of them are captured.
    pub capture_patterns: Vec<String>,

    pub fallback: Option<TextFallback>,

    /// Container the menu is positioned in when the click lands inside one
    pub anchor: Option<String>,
}

/// Capability over one live page
#[async_trait]
pub trait Document: Send + Sync {
    /// First element matching `selector`
    async fn query(&self, selector: &str) -> DomResult<Option<ElementSnapshot>>;

    /// Dispatch a bubbling synthetic event. `Ok(false)` when nothing matched.
    async fn dispatch(&self, selector: &str, event: EventKind) -> DomResult<bool>;

    /// Set `value` through the element prototype's setter, skipping any
    /// per-instance accessor. `Ok(false)` when nothing matched; fails with
    /// [`DomError::SetterUnavailable`] when the prototype has no setter.
    async fn write_native_value(&self, selector: &str, value: &str) -> DomResult<bool>;

    /// Add (`present`) or remove a class. `Ok(false)` when nothing matched.
    async fn toggle_class(&self, selector: &str, class: &str, present: bool) -> DomResult<bool>;

    /// Inject a floating button whose clicks arrive as
    /// [`PageEvent::TriggerClicked`]. Mounting an existing id is a no-op.
    async fn mount_trigger(&self, trigger: &TriggerSpec) -> DomResult<()>;

    /// Remove the first element matching `selector`
    async fn remove(&self, selector: &str) -> DomResult<bool>;

    /// Inject a hidden context menu and capture matching right-clicks as
    /// [`PageEvent::MenuRequested`]. Any click on the page hides it.
    /// Mounting an existing id is a no-op.
    async fn mount_menu(&self, menu: &MenuSpec) -> DomResult<()>;

    /// Show the menu at the last captured right-click with only `items`
    /// visible. `Ok(false)` when the menu is not mounted.
    async fn show_menu(&self, menu: &str, items: &[String]) -> DomResult<bool>;

    /// Remove the menu and its page listeners
    async fn unmount_menu(&self, menu: &str) -> DomResult<()>;

    /// Open `url` in a new tab behind the current one. `Ok(false)` when the
    /// browser blocked the popup.
    async fn open_tab(&self, url: &str) -> DomResult<bool>;

    async fn title(&self) -> DomResult<String>;

    async fn set_title(&self, title: &str) -> DomResult<()>;

    /// Show a blocking alert to the user. Returns without waiting for dismissal.
    async fn alert(&self, message: &str) -> DomResult<()>;

    /// Current `location.href`
    async fn location(&self) -> DomResult<String>;

    /// Attach a childList+subtree observer to the first match of `scope`
    async fn observe(&self, scope: &str) -> DomResult<ObserverId>;

    async fn disconnect(&self, observer: ObserverId) -> DomResult<()>;

    /// Subscribe to page events. Subscribe before acting on anything whose
    /// events you need; earlier events are not replayed.
    fn events(&self) -> broadcast::Receiver<PageEvent>;
}
