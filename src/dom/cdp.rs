//! [`Document`] over a chromiumoxide page
//!
//! Page-side events (mutation batches, `popstate`, trigger clicks) come back
//! through a `Runtime.addBinding` function. The listener task decodes each
//! binding call into a [`PageEvent`] and broadcasts it.

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::{
    AddBindingParams, EvaluateParams, EventBindingCalled,
};
use futures::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::script::{self, BINDING_NAME};
use super::{
    Document, DomError, DomResult, ElementSnapshot, EventKind, MenuSpec, ObserverId, PageEvent,
    TriggerSpec,
};

/// Capacity of the page event channel. Slow subscribers see `Lagged` and
/// re-evaluate once instead of replaying every batch.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum BridgeMessage {
    Mutations { observer: u64, records: usize },
    Navigated,
    Loaded { url: String },
    Trigger { id: String },
    Menu { menu: String, text: String },
    MenuItem { menu: String, item: String },
}

impl From<BridgeMessage> for PageEvent {
    fn from(message: BridgeMessage) -> Self {
        match message {
            BridgeMessage::Mutations { observer, records } => PageEvent::Mutations {
                observer: ObserverId(observer),
                records,
            },
            BridgeMessage::Navigated => PageEvent::Navigated,
            BridgeMessage::Loaded { url } => PageEvent::Loaded { url },
            BridgeMessage::Trigger { id } => PageEvent::TriggerClicked { id },
            BridgeMessage::Menu { menu, text } => PageEvent::MenuRequested { menu, text },
            BridgeMessage::MenuItem { menu, item } => PageEvent::MenuItemClicked { menu, item },
        }
    }
}

#[derive(Debug, Deserialize)]
struct NativeWrite {
    found: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Live page document
///
/// Construct once per page with [`CdpDocument::attach`]. Dropping it stops
/// the binding listener; the page itself stays open.
pub struct CdpDocument {
    page: Page,
    events: broadcast::Sender<PageEvent>,
    listener: JoinHandle<()>,
}

impl CdpDocument {
    /// Register the binding, install the bridge and start forwarding events
    pub async fn attach(page: Page) -> DomResult<Self> {
        page.execute(AddBindingParams::new(BINDING_NAME))
            .await
            .map_err(|e| DomError::Bridge(format!("Runtime.addBinding failed: {e}")))?;

        let mut calls = page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(|e| DomError::Bridge(format!("Failed to listen for binding calls: {e}")))?;

        // Survive full reloads as well as the current document
        page.evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(script::BRIDGE))
            .await
            .map_err(|e| DomError::Bridge(format!("Failed to register bridge script: {e}")))?;
        page.evaluate(script::BRIDGE)
            .await
            .map_err(|e| DomError::Bridge(format!("Failed to install bridge: {e}")))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sender = events.clone();
        let listener = tokio::spawn(async move {
            while let Some(call) = calls.next().await {
                if call.name != BINDING_NAME {
                    continue;
                }
                match serde_json::from_str::<BridgeMessage>(&call.payload) {
                    Ok(message) => {
                        trace!("Page event: {:?}", message);
                        // No subscribers is fine; nothing is waiting
                        let _ = sender.send(message.into());
                    }
                    Err(e) => warn!("Ignoring malformed bridge payload {}: {}", call.payload, e),
                }
            }
            info!("Page binding listener finished");
        });

        debug!("Event bridge attached");
        Ok(Self {
            page,
            events,
            listener,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn eval<T: DeserializeOwned>(&self, expression: String) -> DomResult<T> {
        self.eval_params(EvaluateParams::from(expression)).await
    }

    async fn eval_params<T: DeserializeOwned>(&self, params: EvaluateParams) -> DomResult<T> {
        let raw: String = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| DomError::Evaluation(e.to_string()))?
            .into_value()
            .map_err(|e| DomError::Decode(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| DomError::Decode(format!("{e}: {raw}")))
    }
}

impl Drop for CdpDocument {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Document for CdpDocument {
    async fn query(&self, selector: &str) -> DomResult<Option<ElementSnapshot>> {
        self.eval(script::query(selector)).await
    }

    async fn dispatch(&self, selector: &str, event: EventKind) -> DomResult<bool> {
        self.eval(script::dispatch(selector, event)).await
    }

    async fn write_native_value(&self, selector: &str, value: &str) -> DomResult<bool> {
        let outcome: NativeWrite = self.eval(script::write_native_value(selector, value)).await?;
        match outcome.error {
            Some(reason) => Err(DomError::SetterUnavailable {
                selector: selector.to_string(),
                reason,
            }),
            None => Ok(outcome.found),
        }
    }

    async fn toggle_class(&self, selector: &str, class: &str, present: bool) -> DomResult<bool> {
        self.eval(script::toggle_class(selector, class, present))
            .await
    }

    async fn mount_trigger(&self, trigger: &TriggerSpec) -> DomResult<()> {
        let _: bool = self
            .eval(script::mount_trigger(&trigger.id, &trigger.label))
            .await?;
        Ok(())
    }

    async fn remove(&self, selector: &str) -> DomResult<bool> {
        self.eval(script::remove(selector)).await
    }

    async fn mount_menu(&self, menu: &MenuSpec) -> DomResult<()> {
        let _: bool = self.eval(script::mount_menu(menu)).await?;
        Ok(())
    }

    async fn show_menu(&self, menu: &str, items: &[String]) -> DomResult<bool> {
        self.eval(script::show_menu(menu, items)).await
    }

    async fn unmount_menu(&self, menu: &str) -> DomResult<()> {
        let _: bool = self.eval(script::unmount_menu(menu)).await?;
        Ok(())
    }

    async fn open_tab(&self, url: &str) -> DomResult<bool> {
        let params = EvaluateParams::builder()
            .expression(script::open_tab(url))
            .user_gesture(true)
            .build()
            .map_err(DomError::Evaluation)?;
        self.eval_params(params).await
    }

    async fn title(&self) -> DomResult<String> {
        self.eval(script::TITLE.to_string()).await
    }

    async fn set_title(&self, title: &str) -> DomResult<()> {
        let _: bool = self.eval(script::set_title(title)).await?;
        Ok(())
    }

    async fn alert(&self, message: &str) -> DomResult<()> {
        let _: bool = self.eval(script::alert(message)).await?;
        Ok(())
    }

    async fn location(&self) -> DomResult<String> {
        self.eval(script::LOCATION.to_string()).await
    }

    async fn observe(&self, scope: &str) -> DomResult<ObserverId> {
        let id: Option<u64> = self.eval(script::observe(scope)).await?;
        id.map(ObserverId)
            .ok_or_else(|| DomError::ScopeNotFound(scope.to_string()))
    }

    async fn disconnect(&self, observer: ObserverId) -> DomResult<()> {
        let _: bool = self.eval(script::disconnect(observer.0)).await?;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}
