//! Component supervision for one page
//!
//! Components are bound to a document. When the page loads a new document
//! the old instances are torn down and fresh ones started against it.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Config;
use crate::components::{CaseAssignment, ContextMenu, PageKind, PortalPage, TabTitle};
use crate::dom::{Document, PageEvent};

struct Components {
    tab_title: Option<TabTitle>,
    case_assignment: Option<CaseAssignment>,
    context_menu: Option<ContextMenu>,
}

impl Components {
    async fn start(doc: &Arc<dyn Document>, config: &Config) -> Self {
        let location = doc.location().await.unwrap_or_else(|e| {
            warn!("Cannot read page location: {}", e);
            String::new()
        });
        let on_case_page = PortalPage::classify(&location, &config.portal)
            .is_some_and(|page| page.kind == PageKind::Case);

        let tab_title = config.tab_title.enabled.then(|| {
            TabTitle::start(doc.clone(), config.portal.clone(), config.tab_title.clone())
        });
        let case_assignment = (config.case_assignment.enabled && on_case_page)
            .then(|| CaseAssignment::start(doc.clone(), config.case_assignment.clone()));
        let context_menu = if config.context_menu.enabled {
            ContextMenu::from_config(doc.clone(), config.context_menu.clone())
                .inspect_err(|e| warn!("Context menu not started: {}", e))
                .ok()
        } else {
            None
        };

        info!(
            location = %location,
            tab_title = tab_title.is_some(),
            case_assignment = case_assignment.is_some(),
            context_menu = context_menu.is_some(),
            "Components started"
        );
        Self {
            tab_title,
            case_assignment,
            context_menu,
        }
    }

    async fn teardown(self) {
        if let Some(tab_title) = self.tab_title {
            tab_title.teardown().await;
        }
        if let Some(case_assignment) = self.case_assignment {
            case_assignment.teardown().await;
        }
        if let Some(context_menu) = self.context_menu {
            context_menu.teardown().await;
        }
    }
}

/// All portal components on one page, restarted on every document load
pub struct PortalSession {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PortalSession {
    pub fn start(doc: Arc<dyn Document>, config: Config) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(doc, config, cancel.clone()));
        Self { cancel, handle }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Portal session ended abnormally: {}", e);
        }
    }
}

async fn supervise(doc: Arc<dyn Document>, config: Config, cancel: CancellationToken) {
    let mut events = doc.events();
    let mut components = Components::start(&doc, &config).await;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(PageEvent::Loaded { url }) => {
                info!(url = %url, "New document, restarting components");
                components.teardown().await;
                components = Components::start(&doc, &config).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Page events lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    components.teardown().await;
    debug!("Portal session stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PortalConfig;
    use crate::dom::fake::{FakeDocument, FakeElement};
    use std::time::Duration;

    fn config() -> Config {
        Config {
            portal: PortalConfig {
                case_prefix: "https://portal.test/apps/case/".into(),
                alert_prefix: "https://portal.test/apps/alert/".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_assignment_leaves_titles_working() {
        let config = config();
        let doc = Arc::new(FakeDocument::new("https://portal.test/apps/case/1234"));
        doc.insert("body", FakeElement::new("body"));
        doc.insert(
            &config.tab_title.case_client_selector,
            FakeElement::new("p").text("Acme Corp"),
        );

        let session = PortalSession::start(doc.clone(), config);
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert_eq!(doc.alerts(), vec!["Error: User name element not found.".to_string()]);
        assert_eq!(doc.current_title(), "Case 1234 - Acme Corp");
        session.shutdown().await;
    }

    /// Right-click an IP and pick "Analyze"
    async fn analyze_ip(doc: &FakeDocument) {
        doc.right_click("192.168.10.5");
        tokio::time::sleep(Duration::from_millis(1)).await;
        doc.click_menu_item("analyzer-menu", "analyze");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn menu_works_after_user_name_times_out() {
        let config = config();
        let doc = Arc::new(FakeDocument::new("https://portal.test/apps/case/1234"));
        doc.insert("body", FakeElement::new("body"));

        let session = PortalSession::start(doc.clone(), config);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(doc.alerts(), vec!["Error: User name element not found.".to_string()]);

        analyze_ip(&doc).await;
        assert_eq!(doc.opened_tabs().len(), 3);
        assert_eq!(doc.alerts().len(), 1);
        session.shutdown().await;
        assert!(!doc.has_menu("analyzer-menu"));
    }

    #[tokio::test(start_paused = true)]
    async fn menu_works_after_assignment_form_fails() {
        let config = config();
        let doc = Arc::new(FakeDocument::new("https://portal.test/apps/case/1234"));
        doc.insert("body", FakeElement::new("body"));
        doc.insert(
            &config.case_assignment.user_name_selector,
            FakeElement::new("p").text("Jane Smith"),
        );
        doc.insert(
            &config.case_assignment.assignee_selector,
            FakeElement::controlled("input", "A. Jones"),
        );

        let session = PortalSession::start(doc.clone(), config.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        doc.click_trigger(&config.case_assignment.trigger_id);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(
            doc.alerts(),
            vec!["Error: Add Narrative button not found.".to_string()]
        );

        analyze_ip(&doc).await;
        assert_eq!(
            doc.opened_tabs()[0],
            "https://www.virustotal.com/gui/ip-address/192.168.10.5"
        );
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn menu_is_rebuilt_once_per_document() {
        let config = config();
        let doc = Arc::new(FakeDocument::new("https://portal.test/apps/home"));
        doc.insert("body", FakeElement::new("body"));

        let session = PortalSession::start(doc.clone(), config);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(doc.menus_mounted(), 1);

        doc.load("https://portal.test/apps/home");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(doc.menus_mounted(), 2);
        assert!(doc.has_menu("analyzer-menu"));

        analyze_ip(&doc).await;
        assert_eq!(doc.opened_tabs().len(), 3);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_only_runs_on_case_pages() {
        let config = config();
        let doc = Arc::new(FakeDocument::new("https://portal.test/apps/alert/77"));
        doc.insert("body", FakeElement::new("body"));

        let session = PortalSession::start(doc.clone(), config);
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert!(doc.alerts().is_empty());
        assert_eq!(doc.query_count("p.username"), 0);
        assert_eq!(doc.current_title(), "Alert 77 - Unknown Client");
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_document_restarts_components() {
        let config = config();
        let doc = Arc::new(FakeDocument::new("https://portal.test/apps/home"));
        doc.insert("body", FakeElement::new("body"));

        let session = PortalSession::start(doc.clone(), config.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(doc.current_title(), "");

        doc.load("https://portal.test/apps/case/55");
        doc.insert("body", FakeElement::new("body"));
        doc.insert(
            &config.tab_title.case_client_selector,
            FakeElement::new("p").text("Globex"),
        );
        doc.insert(&config.case_assignment.user_name_selector, FakeElement::new("p").text("Jane Smith"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(doc.current_title(), "Case 55 - Globex");
        assert_eq!(doc.triggers().len(), 1);

        session.shutdown().await;
        assert_eq!(doc.live_observers(), 0);
    }
}
