//! In-memory [`Document`] for tests
//!
//! Elements are keyed by the exact selector used to reach them. Controls
//! created with [`FakeElement::controlled`] model a framework value tracker:
//! the framework's own model only picks up a new value when an `input` or
//! `change` event arrives and the element value differs from the tracker,
//! and a plain instance assignment updates the tracker too, so it is never
//! seen as a change.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::broadcast;

use super::{
    Document, DomError, DomResult, ElementSnapshot, EventKind, MenuSpec, ObserverId, PageEvent,
    TriggerSpec,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeElement {
    tag: String,
    text: String,
    value: Option<String>,
    tracker: Option<String>,
    model: Option<String>,
    classes: BTreeSet<String>,
}

impl FakeElement {
    pub(crate) fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Form control with no framework attached
    pub(crate) fn plain(tag: &str, value: &str) -> Self {
        Self {
            value: Some(value.to_string()),
            model: Some(value.to_string()),
            ..Self::new(tag)
        }
    }

    /// Form control whose value is owned by a framework model
    pub(crate) fn controlled(tag: &str, value: &str) -> Self {
        Self {
            tracker: Some(value.to_string()),
            ..Self::plain(tag, value)
        }
    }

    fn snapshot(&self) -> ElementSnapshot {
        ElementSnapshot {
            tag: self.tag.clone(),
            text: self.text.clone(),
            value: self.value.clone(),
        }
    }

    fn receive(&mut self, event: EventKind) {
        if !matches!(event, EventKind::Input | EventKind::Change) {
            return;
        }
        match &self.tracker {
            Some(tracked) if self.value.as_ref() != Some(tracked) => {
                self.tracker = self.value.clone();
                self.model = self.value.clone();
            }
            Some(_) => {}
            None => self.model = self.value.clone(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    elements: HashMap<String, FakeElement>,
    queries: HashMap<String, usize>,
    failing: HashSet<String>,
    dispatched: Vec<(String, EventKind)>,
    reveal_on_open: HashMap<String, (String, FakeElement)>,
    setter_missing: bool,
    title: String,
    location: String,
    alerts: Vec<String>,
    triggers: Vec<TriggerSpec>,
    observers: BTreeSet<u64>,
    next_observer: u64,
    menus: HashMap<String, FakeMenu>,
    menus_mounted: usize,
    opened_tabs: Vec<String>,
    popups_blocked: bool,
}

struct FakeMenu {
    patterns: Vec<Regex>,
    shown: Option<Vec<String>>,
}

pub(crate) struct FakeDocument {
    state: Mutex<FakeState>,
    events: broadcast::Sender<PageEvent>,
}

impl FakeDocument {
    pub(crate) fn new(location: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(FakeState {
                location: location.to_string(),
                next_observer: 1,
                ..Default::default()
            }),
            events,
        }
    }

    pub(crate) fn insert(&self, selector: &str, element: FakeElement) {
        self.state
            .lock()
            .elements
            .insert(selector.to_string(), element);
    }

    pub(crate) fn remove_element(&self, selector: &str) {
        self.state.lock().elements.remove(selector);
    }

    /// Queries of `selector` fail with an evaluation error
    pub(crate) fn fail_queries(&self, selector: &str) {
        self.state.lock().failing.insert(selector.to_string());
    }

    /// Prototype value setters are unavailable
    pub(crate) fn without_native_setter(&self) {
        self.state.lock().setter_missing = true;
    }

    /// Opening `trigger` (mouseup) renders `option`
    pub(crate) fn reveal_on_open(&self, trigger: &str, option: &str, element: FakeElement) {
        self.state
            .lock()
            .reveal_on_open
            .insert(trigger.to_string(), (option.to_string(), element));
    }

    /// Plain instance assignment, as naive code would do it
    pub(crate) fn assign_value(&self, selector: &str, value: &str) {
        if let Some(element) = self.state.lock().elements.get_mut(selector) {
            element.value = Some(value.to_string());
            if element.tracker.is_some() {
                element.tracker = Some(value.to_string());
            }
        }
    }

    pub(crate) fn contains(&self, selector: &str) -> bool {
        self.state.lock().elements.contains_key(selector)
    }

    /// Value the framework model holds for `selector`
    pub(crate) fn model_value(&self, selector: &str) -> Option<String> {
        self.state
            .lock()
            .elements
            .get(selector)
            .and_then(|e| e.model.clone())
    }

    pub(crate) fn displayed_value(&self, selector: &str) -> Option<String> {
        self.state
            .lock()
            .elements
            .get(selector)
            .and_then(|e| e.value.clone())
    }

    pub(crate) fn has_class(&self, selector: &str, class: &str) -> bool {
        self.state
            .lock()
            .elements
            .get(selector)
            .is_some_and(|e| e.classes.contains(class))
    }

    pub(crate) fn query_count(&self, selector: &str) -> usize {
        self.state.lock().queries.get(selector).copied().unwrap_or(0)
    }

    pub(crate) fn dispatched(&self) -> Vec<(String, EventKind)> {
        self.state.lock().dispatched.clone()
    }

    pub(crate) fn dispatched_to(&self, selector: &str) -> Vec<EventKind> {
        self.state
            .lock()
            .dispatched
            .iter()
            .filter(|(target, _)| target == selector)
            .map(|(_, event)| *event)
            .collect()
    }

    pub(crate) fn alerts(&self) -> Vec<String> {
        self.state.lock().alerts.clone()
    }

    pub(crate) fn current_title(&self) -> String {
        self.state.lock().title.clone()
    }

    pub(crate) fn triggers(&self) -> Vec<TriggerSpec> {
        self.state.lock().triggers.clone()
    }

    pub(crate) fn live_observers(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Deliver one observer callback carrying `records` records to every
    /// connected observer
    pub(crate) fn mutate(&self, records: usize) {
        let observers: Vec<u64> = self.state.lock().observers.iter().copied().collect();
        for id in observers {
            let _ = self.events.send(PageEvent::Mutations {
                observer: ObserverId(id),
                records,
            });
        }
    }

    /// Deliver `callbacks` single-record observer callbacks back to back,
    /// before any subscriber gets to run
    pub(crate) fn mutate_separately(&self, callbacks: usize) {
        for _ in 0..callbacks {
            self.mutate(1);
        }
    }

    /// Replace the document: new location, no elements, no observers
    pub(crate) fn load(&self, location: &str) {
        {
            let mut state = self.state.lock();
            state.location = location.to_string();
            state.elements.clear();
            state.observers.clear();
            state.menus.clear();
        }
        let _ = self.events.send(PageEvent::Loaded {
            url: location.to_string(),
        });
    }

    pub(crate) fn pop_state(&self) {
        let _ = self.events.send(PageEvent::Navigated);
    }

    pub(crate) fn click_trigger(&self, id: &str) {
        let _ = self.events.send(PageEvent::TriggerClicked { id: id.to_string() });
    }

    /// Right-click on `text`. Every mounted, hidden menu with a matching
    /// capture pattern requests to be shown.
    pub(crate) fn right_click(&self, text: &str) {
        let requested: Vec<String> = self
            .state
            .lock()
            .menus
            .iter()
            .filter(|(_, menu)| menu.shown.is_none())
            .filter(|(_, menu)| menu.patterns.iter().any(|p| p.is_match(text)))
            .map(|(id, _)| id.clone())
            .collect();
        for menu in requested {
            let _ = self.events.send(PageEvent::MenuRequested {
                menu,
                text: text.to_string(),
            });
        }
    }

    /// Click an item of a shown menu. The click also hides the menu.
    pub(crate) fn click_menu_item(&self, menu: &str, item: &str) {
        let visible = {
            let mut state = self.state.lock();
            let visible = state
                .menus
                .get(menu)
                .and_then(|m| m.shown.as_ref())
                .is_some_and(|items| items.iter().any(|i| i == item));
            for menu in state.menus.values_mut() {
                menu.shown = None;
            }
            visible
        };
        if visible {
            let _ = self.events.send(PageEvent::MenuItemClicked {
                menu: menu.to_string(),
                item: item.to_string(),
            });
        }
    }

    /// Click anywhere outside a menu
    pub(crate) fn click_page(&self) {
        for menu in self.state.lock().menus.values_mut() {
            menu.shown = None;
        }
    }

    /// Items of `menu` currently shown, `None` while hidden
    pub(crate) fn shown_menu_items(&self, menu: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .menus
            .get(menu)
            .and_then(|m| m.shown.clone())
    }

    pub(crate) fn has_menu(&self, menu: &str) -> bool {
        self.state.lock().menus.contains_key(menu)
    }

    /// How many times a menu was actually built
    pub(crate) fn menus_mounted(&self) -> usize {
        self.state.lock().menus_mounted
    }

    pub(crate) fn opened_tabs(&self) -> Vec<String> {
        self.state.lock().opened_tabs.clone()
    }

    pub(crate) fn block_popups(&self) {
        self.state.lock().popups_blocked = true;
    }
}

#[async_trait]
impl Document for FakeDocument {
    async fn query(&self, selector: &str) -> DomResult<Option<ElementSnapshot>> {
        let mut state = self.state.lock();
        *state.queries.entry(selector.to_string()).or_default() += 1;
        if state.failing.contains(selector) {
            return Err(DomError::Evaluation(format!("query of {selector} threw")));
        }
        Ok(state.elements.get(selector).map(FakeElement::snapshot))
    }

    async fn dispatch(&self, selector: &str, event: EventKind) -> DomResult<bool> {
        let mut state = self.state.lock();
        let Some(element) = state.elements.get_mut(selector) else {
            return Ok(false);
        };
        element.receive(event);
        state.dispatched.push((selector.to_string(), event));
        if event == EventKind::MouseUp
            && let Some((option, element)) = state.reveal_on_open.remove(selector)
        {
            state.elements.insert(option, element);
        }
        Ok(true)
    }

    async fn write_native_value(&self, selector: &str, value: &str) -> DomResult<bool> {
        let mut state = self.state.lock();
        let setter_missing = state.setter_missing;
        let Some(element) = state.elements.get_mut(selector) else {
            return Ok(false);
        };
        if setter_missing {
            return Err(DomError::SetterUnavailable {
                selector: selector.to_string(),
                reason: format!("no value setter on <{}> prototype", element.tag),
            });
        }
        element.value = Some(value.to_string());
        Ok(true)
    }

    async fn toggle_class(&self, selector: &str, class: &str, present: bool) -> DomResult<bool> {
        let mut state = self.state.lock();
        let Some(element) = state.elements.get_mut(selector) else {
            return Ok(false);
        };
        if present {
            element.classes.insert(class.to_string());
        } else {
            element.classes.remove(class);
        }
        Ok(true)
    }

    async fn mount_trigger(&self, trigger: &TriggerSpec) -> DomResult<()> {
        let mut state = self.state.lock();
        let selector = trigger.selector();
        if !state.elements.contains_key(&selector) {
            state
                .elements
                .insert(selector, FakeElement::new("button").text(&trigger.label));
            state.triggers.push(trigger.clone());
        }
        Ok(())
    }

    async fn remove(&self, selector: &str) -> DomResult<bool> {
        Ok(self.state.lock().elements.remove(selector).is_some())
    }

    async fn mount_menu(&self, menu: &MenuSpec) -> DomResult<()> {
        let mut state = self.state.lock();
        if state.menus.contains_key(&menu.id) {
            return Ok(());
        }
        let patterns = menu
            .capture_patterns
            .iter()
            .map(|source| Regex::new(source))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DomError::Evaluation(format!("invalid capture pattern: {e}")))?;
        state.menus.insert(
            menu.id.clone(),
            FakeMenu {
                patterns,
                shown: None,
            },
        );
        state.menus_mounted += 1;
        Ok(())
    }

    async fn show_menu(&self, menu: &str, items: &[String]) -> DomResult<bool> {
        let mut state = self.state.lock();
        let Some(menu) = state.menus.get_mut(menu) else {
            return Ok(false);
        };
        menu.shown = Some(items.to_vec());
        Ok(true)
    }

    async fn unmount_menu(&self, menu: &str) -> DomResult<()> {
        self.state.lock().menus.remove(menu);
        Ok(())
    }

    async fn open_tab(&self, url: &str) -> DomResult<bool> {
        let mut state = self.state.lock();
        if state.popups_blocked {
            return Ok(false);
        }
        state.opened_tabs.push(url.to_string());
        Ok(true)
    }

    async fn title(&self) -> DomResult<String> {
        Ok(self.state.lock().title.clone())
    }

    async fn set_title(&self, title: &str) -> DomResult<()> {
        self.state.lock().title = title.to_string();
        Ok(())
    }

    async fn alert(&self, message: &str) -> DomResult<()> {
        self.state.lock().alerts.push(message.to_string());
        Ok(())
    }

    async fn location(&self) -> DomResult<String> {
        Ok(self.state.lock().location.clone())
    }

    async fn observe(&self, scope: &str) -> DomResult<ObserverId> {
        let mut state = self.state.lock();
        if !state.elements.contains_key(scope) {
            return Err(DomError::ScopeNotFound(scope.to_string()));
        }
        let id = state.next_observer;
        state.next_observer += 1;
        state.observers.insert(id);
        Ok(ObserverId(id))
    }

    async fn disconnect(&self, observer: ObserverId) -> DomResult<()> {
        self.state.lock().observers.remove(&observer.0);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}
