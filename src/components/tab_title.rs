//! Tab titles for case and alert pages
//!
//! `Case 1234 - Acme Corp` instead of the portal's generic title, so a
//! row of tabs can be told apart.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::dom::{Document, ElementSnapshot};
use crate::engine::{ElementPresent, PollPolicy, WatchTask};
use crate::{ConfigError, PortalConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabTitleConfig {
    pub enabled: bool,

    /// Client name on alert pages
    pub alert_client_selector: String,

    /// Alert pages render the client name late and nothing is waited on;
    /// the title is written once after this delay
    pub alert_delay_ms: u64,

    /// Client name on case pages
    pub case_client_selector: String,

    /// Cases with thousands of alerts can take ~20 seconds to render
    pub case_poll: PollPolicy,

    pub observe_scope: String,

    pub unknown_client: String,
}

impl Default for TabTitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alert_client_selector: "p.h1.mb-24".to_string(),
            alert_delay_ms: 2000,
            case_client_selector:
                "p.MuiTypography-root.h1.mb-24.MuiTypography-body1.MuiTypography-colorTextSecondary"
                    .to_string(),
            case_poll: PollPolicy::new(80, 250),
            observe_scope: "body".to_string(),
            unknown_client: "Unknown Client".to_string(),
        }
    }
}

impl TabTitleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.case_poll.validate("tab_title.case_poll")
    }

    fn client_name(&self, element: Option<&ElementSnapshot>) -> String {
        element
            .map(|e| e.text.trim())
            .filter(|text| !text.is_empty())
            .unwrap_or(self.unknown_client.as_str())
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Case,
    Alert,
}

impl PageKind {
    fn label(self) -> &'static str {
        match self {
            PageKind::Case => "Case",
            PageKind::Alert => "Alert",
        }
    }
}

/// A case or alert page and its number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalPage {
    pub kind: PageKind,
    pub number: String,
}

impl PortalPage {
    /// Classify `location`. Only URLs under a configured prefix whose last
    /// path segment is a number qualify.
    pub fn classify(location: &str, portal: &PortalConfig) -> Option<Self> {
        let kind = if location.starts_with(&portal.case_prefix) {
            PageKind::Case
        } else if location.starts_with(&portal.alert_prefix) {
            PageKind::Alert
        } else {
            return None;
        };
        let url = Url::parse(location).ok()?;
        let number = url.path_segments()?.next_back()?;
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            kind,
            number: number.to_string(),
        })
    }

    pub fn title(&self, client: &str) -> String {
        format!("{} {} - {}", self.kind.label(), self.number, client)
    }
}

async fn write_title(doc: &dyn Document, title: &str) {
    match doc.set_title(title).await {
        Ok(()) => info!(title, "Tab title set"),
        Err(e) => warn!(title, "Failed to set tab title: {}", e),
    }
}

pub struct TabTitle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TabTitle {
    pub fn start(doc: Arc<dyn Document>, portal: PortalConfig, config: TabTitleConfig) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(doc, portal, config, cancel.clone()));
        Self { cancel, handle }
    }

    /// Wait until the title has been written or given up on
    pub async fn finished(self) {
        if let Err(e) = self.handle.await {
            warn!("Tab title task ended abnormally: {}", e);
        }
    }

    pub async fn teardown(self) {
        self.cancel.cancel();
        self.finished().await;
    }
}

async fn run(
    doc: Arc<dyn Document>,
    portal: PortalConfig,
    config: TabTitleConfig,
    cancel: CancellationToken,
) {
    let location = match doc.location().await {
        Ok(location) => location,
        Err(e) => {
            warn!("Cannot read page location: {}", e);
            return;
        }
    };
    let Some(page) = PortalPage::classify(&location, &portal) else {
        debug!(location = %location, "Not a case or alert page");
        return;
    };

    match page.kind {
        PageKind::Alert => {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(config.alert_delay_ms)) => {}
            }
            let client = match doc.query(&config.alert_client_selector).await {
                Ok(found) => config.client_name(found.as_ref()),
                Err(e) => {
                    warn!(selector = %config.alert_client_selector, "Client name lookup failed: {}", e);
                    config.unknown_client.clone()
                }
            };
            write_title(doc.as_ref(), &page.title(&client)).await;
        }
        PageKind::Case => {
            if let Ok(Some(found)) = doc.query(&config.case_client_selector).await {
                write_title(doc.as_ref(), &page.title(&config.client_name(Some(&found)))).await;
                return;
            }

            let satisfied_doc = doc.clone();
            let satisfied_page = page.clone();
            let satisfied_config = config.clone();
            let timeout_doc = doc.clone();
            let fallback = page.title(&config.unknown_client);
            let task = WatchTask::builder(ElementPresent::new(
                "Client name",
                config.case_client_selector.clone(),
            ))
            .policy(config.case_poll)
            .observe(config.observe_scope.clone())
            .cancelled_by(&cancel)
            .on_satisfied(move |found| async move {
                let client = satisfied_config.client_name(Some(&found));
                write_title(satisfied_doc.as_ref(), &satisfied_page.title(&client)).await;
            })
            .on_timeout(move || async move {
                write_title(timeout_doc.as_ref(), &fallback).await;
            })
            .spawn(doc);
            let state = task.finished().await;
            debug!(?state, "Case title watch finished");
        }
    }
}
