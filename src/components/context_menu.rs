//! Lookup menu for indicators in the page
//!
//! Right-clicking selected text that looks like an IP address, a SHA256 hash
//! or an event id opens a small menu instead of the browser's own. "Analyze"
//! opens threat-intel lookups for IPs and hashes, "ID Lookup" opens the SIEM
//! search for an event id. Each lookup lands in a background tab.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ConfigError;
use crate::dom::{Document, MenuItemSpec, MenuSpec, PageEvent, TextFallback};

pub const POPUP_BLOCKED_ALERT: &str =
    "Popup blocked. Please allow popups for this site and try again.";
pub const TAB_ERROR_ALERT: &str = "Error opening tab. Please check your browser settings.";

/// Kind of value the right-clicked text was recognised as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Ip,
    Sha256,
    EventId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MenuAction {
    Analyze,
    IdLookup,
}

impl MenuAction {
    pub const ALL: [MenuAction; 2] = [MenuAction::Analyze, MenuAction::IdLookup];

    /// Item id in the page
    pub fn id(self) -> &'static str {
        match self {
            MenuAction::Analyze => "analyze",
            MenuAction::IdLookup => "id-lookup",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MenuAction::Analyze => "Analyze",
            MenuAction::IdLookup => "ID Lookup",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.id() == id)
    }

    pub fn applies_to(self, indicators: &[Indicator]) -> bool {
        match self {
            MenuAction::Analyze => indicators
                .iter()
                .any(|i| matches!(i, Indicator::Ip | Indicator::Sha256)),
            MenuAction::IdLookup => indicators.contains(&Indicator::EventId),
        }
    }
}

/// Decides what a piece of right-clicked text is
pub trait IndicatorClassifier: Send + Sync {
    /// Every indicator kind `text` matches, possibly none
    fn classify(&self, text: &str) -> Vec<Indicator>;

    /// Pattern sources the page uses to decide whether a right-click is
    /// captured at all. Must accept everything `classify` recognises.
    fn page_patterns(&self) -> Vec<String>;
}

/// Builds the URLs a menu action opens
pub trait LookupUrls: Send + Sync {
    fn urls(&self, action: MenuAction, indicators: &[Indicator], text: &str) -> Vec<String>;
}

/// Regex sources, valid both for the `regex` crate and in page JavaScript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorPatterns {
    pub ipv4: String,
    pub ipv6: String,
    pub sha256: String,
    pub event_id: String,
}

impl Default for IndicatorPatterns {
    fn default() -> Self {
        Self {
            ipv4: r"\b(?:\d{1,3}\.){3}\d{1,3}\b".to_string(),
            ipv6: r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b|\b(?:[0-9a-fA-F]{1,4}:){1,7}(?::[0-9a-fA-F]{1,4}){0,6}\b".to_string(),
            sha256: r"\b[0-9a-fA-F]{64}\b".to_string(),
            event_id: r"\b[a-zA-Z0-9+/=_-]{20,50}\b".to_string(),
        }
    }
}

impl IndicatorPatterns {
    fn sources(&self) -> [(&'static str, &str); 4] {
        [
            ("ipv4", &self.ipv4),
            ("ipv6", &self.ipv6),
            ("sha256", &self.sha256),
            ("event_id", &self.event_id),
        ]
    }
}

fn compile(name: &str, source: &str) -> Result<Regex, ConfigError> {
    Regex::new(source).map_err(|e| {
        ConfigError::Invalid(format!("context_menu.patterns.{name} '{source}': {e}"))
    })
}

/// [`IndicatorClassifier`] over [`IndicatorPatterns`]
pub struct PatternClassifier {
    sources: Vec<String>,
    ipv4: Regex,
    ipv6: Regex,
    sha256: Regex,
    event_id: Regex,
}

impl PatternClassifier {
    pub fn new(patterns: &IndicatorPatterns) -> Result<Self, ConfigError> {
        Ok(Self {
            sources: patterns
                .sources()
                .iter()
                .map(|(_, source)| source.to_string())
                .collect(),
            ipv4: compile("ipv4", &patterns.ipv4)?,
            ipv6: compile("ipv6", &patterns.ipv6)?,
            sha256: compile("sha256", &patterns.sha256)?,
            event_id: compile("event_id", &patterns.event_id)?,
        })
    }
}

impl IndicatorClassifier for PatternClassifier {
    fn classify(&self, text: &str) -> Vec<Indicator> {
        let mut found = Vec::new();
        if self.ipv4.is_match(text) || self.ipv6.is_match(text) {
            found.push(Indicator::Ip);
        }
        if self.sha256.is_match(text) {
            found.push(Indicator::Sha256);
        }
        if self.event_id.is_match(text) {
            found.push(Indicator::EventId);
        }
        found
    }

    fn page_patterns(&self) -> Vec<String> {
        self.sources.clone()
    }
}

/// URL templates. `{value}` is replaced by the text as selected, `{encoded}`
/// by its percent-encoded form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupTemplates {
    pub ip: Vec<String>,
    pub sha256: Vec<String>,
    pub event_id: Vec<String>,
}

impl Default for LookupTemplates {
    fn default() -> Self {
        Self {
            ip: vec![
                "https://www.virustotal.com/gui/ip-address/{value}".to_string(),
                "https://www.abuseipdb.com/check/{value}".to_string(),
                "https://ipinfo.io/{value}".to_string(),
            ],
            sha256: vec!["https://www.virustotal.com/gui/file/{value}".to_string()],
            event_id: vec![
                "https://siem.agileblue.com/app/discover#/?_g=(filters:!(),refreshInterval:(pause:!t,value:60000),time:(from:now%2Fd,to:now%2Fd))&_a=(columns:!(),dataSource:(dataViewId:'9079f5b2-b472-46f0-ba7e-fe1f7fddf607',type:dataView),filters:!(),hideChart:!f,interval:auto,query:(language:kuery,query:'_id:{encoded}'),sort:!(!('@timestamp',desc)))".to_string(),
            ],
        }
    }
}

/// [`LookupUrls`] filling [`LookupTemplates`]
pub struct TemplateLookups {
    templates: LookupTemplates,
}

impl TemplateLookups {
    pub fn new(templates: LookupTemplates) -> Self {
        Self { templates }
    }

    fn fill(templates: &[String], text: &str) -> Vec<String> {
        let encoded = urlencoding::encode(text);
        templates
            .iter()
            .map(|t| t.replace("{encoded}", &encoded).replace("{value}", text))
            .collect()
    }
}

impl LookupUrls for TemplateLookups {
    fn urls(&self, action: MenuAction, indicators: &[Indicator], text: &str) -> Vec<String> {
        let templates = match action {
            // An IP takes precedence over a hash
            MenuAction::Analyze if indicators.contains(&Indicator::Ip) => &self.templates.ip,
            MenuAction::Analyze if indicators.contains(&Indicator::Sha256) => {
                &self.templates.sha256
            }
            MenuAction::IdLookup if indicators.contains(&Indicator::EventId) => {
                &self.templates.event_id
            }
            _ => return Vec::new(),
        };
        Self::fill(templates, text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextMenuConfig {
    pub enabled: bool,

    pub menu_id: String,

    /// With nothing selected, the text of `fallback_value_selector` inside
    /// the closest `fallback_cell_selector` of the click target is used
    pub fallback_cell_selector: String,
    pub fallback_value_selector: String,

    /// The menu is positioned inside this container when the click lands
    /// in one, so it scrolls along with a flyout
    pub anchor_selector: String,

    pub patterns: IndicatorPatterns,

    pub lookups: LookupTemplates,

    /// Delay between consecutive tabs of one lookup
    pub tab_stagger_ms: u64,
}

impl Default for ContextMenuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            menu_id: "analyzer-menu".to_string(),
            fallback_cell_selector: ".euiDataGridRowCell".to_string(),
            fallback_value_selector: ".kbnDocViewer__value".to_string(),
            anchor_selector: ".euiFlyout".to_string(),
            patterns: IndicatorPatterns::default(),
            lookups: LookupTemplates::default(),
            tab_stagger_ms: 200,
        }
    }
}

impl ContextMenuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, source) in self.patterns.sources() {
            compile(name, source)?;
        }
        if self.menu_id.is_empty() {
            return Err(ConfigError::Invalid(
                "context_menu.menu_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn menu_spec(&self, capture_patterns: Vec<String>) -> MenuSpec {
        MenuSpec {
            id: self.menu_id.clone(),
            items: MenuAction::ALL
                .into_iter()
                .map(|action| MenuItemSpec {
                    id: action.id().to_string(),
                    label: action.label().to_string(),
                })
                .collect(),
            capture_patterns,
            fallback: Some(TextFallback {
                cell: self.fallback_cell_selector.clone(),
                value: self.fallback_value_selector.clone(),
            }),
            anchor: (!self.anchor_selector.is_empty()).then(|| self.anchor_selector.clone()),
        }
    }
}

pub struct ContextMenu {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ContextMenu {
    pub fn start(
        doc: Arc<dyn Document>,
        classifier: Arc<dyn IndicatorClassifier>,
        lookups: Arc<dyn LookupUrls>,
        config: ContextMenuConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(doc, classifier, lookups, config, cancel.clone()));
        Self { cancel, handle }
    }

    /// Start with the pattern classifier and URL templates from `config`
    pub fn from_config(
        doc: Arc<dyn Document>,
        config: ContextMenuConfig,
    ) -> Result<Self, ConfigError> {
        let classifier = Arc::new(PatternClassifier::new(&config.patterns)?);
        let lookups = Arc::new(TemplateLookups::new(config.lookups.clone()));
        Ok(Self::start(doc, classifier, lookups, config))
    }

    /// Stop handling clicks and remove the menu from the page
    pub async fn teardown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Context menu task ended abnormally: {}", e);
        }
    }
}

/// Text and classification behind the menu currently shown
struct Shown {
    text: String,
    indicators: Vec<Indicator>,
}

async fn run(
    doc: Arc<dyn Document>,
    classifier: Arc<dyn IndicatorClassifier>,
    lookups: Arc<dyn LookupUrls>,
    config: ContextMenuConfig,
    cancel: CancellationToken,
) {
    let mut events = doc.events();
    if let Err(e) = doc
        .mount_menu(&config.menu_spec(classifier.page_patterns()))
        .await
    {
        warn!(menu = %config.menu_id, "Failed to mount context menu: {}", e);
        return;
    }
    info!(menu = %config.menu_id, "Context menu mounted");

    let stagger = Duration::from_millis(config.tab_stagger_ms);
    let mut shown: Option<Shown> = None;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(PageEvent::MenuRequested { menu, text }) if menu == config.menu_id => {
                let indicators = classifier.classify(&text);
                let items: Vec<String> = MenuAction::ALL
                    .into_iter()
                    .filter(|action| action.applies_to(&indicators))
                    .map(|action| action.id().to_string())
                    .collect();
                if items.is_empty() {
                    debug!(text = %text, "Nothing to look up");
                    continue;
                }
                match doc.show_menu(&menu, &items).await {
                    Ok(true) => {
                        debug!(text = %text, ?indicators, "Context menu shown");
                        shown = Some(Shown { text, indicators });
                    }
                    Ok(false) => warn!(menu = %menu, "Context menu is gone from the page"),
                    Err(e) => warn!(menu = %menu, "Failed to show context menu: {}", e),
                }
            }
            Ok(PageEvent::MenuItemClicked { menu, item }) if menu == config.menu_id => {
                let Some(action) = MenuAction::from_id(&item) else {
                    warn!(item = %item, "Unknown context menu item");
                    continue;
                };
                let Some(Shown { text, indicators }) = shown.take() else {
                    debug!(item = %item, "Menu item clicked with no text behind it");
                    continue;
                };
                let urls = lookups.urls(action, &indicators, &text);
                if urls.is_empty() {
                    warn!(text = %text, action = action.label(), "No lookup URLs");
                    continue;
                }
                info!(text = %text, action = action.label(), tabs = urls.len(), "Opening lookups");
                if !open_tabs(doc.as_ref(), &urls, stagger, &cancel).await {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Context menu events lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    if let Err(e) = doc.unmount_menu(&config.menu_id).await {
        debug!(menu = %config.menu_id, "Failed to unmount context menu: {}", e);
    }
    debug!("Context menu stopped");
}

/// Open `urls` one after another, `stagger` apart. The first failure is
/// alerted and ends the batch. Returns false when cancelled.
async fn open_tabs(
    doc: &dyn Document,
    urls: &[String],
    stagger: Duration,
    cancel: &CancellationToken,
) -> bool {
    for (index, url) in urls.iter().enumerate() {
        if index > 0 {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(stagger) => {}
            }
        }
        let message = match doc.open_tab(url).await {
            Ok(true) => {
                debug!(url = %url, "Lookup tab opened");
                continue;
            }
            Ok(false) => {
                warn!(url = %url, "Lookup tab blocked by the popup blocker");
                POPUP_BLOCKED_ALERT
            }
            Err(e) => {
                warn!(url = %url, "Failed to open lookup tab: {}", e);
                TAB_ERROR_ALERT
            }
        };
        if let Err(e) = doc.alert(message).await {
            warn!("Failed to show alert: {}", e);
        }
        break;
    }
    true
}
