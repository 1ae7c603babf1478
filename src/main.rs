// Portal automation host
//
// Opens the portal in a visible Chrome window, attaches the page event
// bridge and keeps the tab title and case assignment components running
// until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use portal_automation::dom::CdpDocument;
use portal_automation::{BrowserManager, PortalSession, load_yaml_config};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let config = load_yaml_config().context("Failed to load configuration")?;
    let manager = BrowserManager::new(config.browser.clone());

    let result = run(&manager, config).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }

    manager.shutdown().await?;
    result
}

async fn run(manager: &BrowserManager, config: portal_automation::Config) -> Result<()> {
    let timeout = Duration::from_millis(config.portal.navigation_timeout_ms);
    let page = manager
        .open_page(&config.portal.start_url, timeout)
        .await
        .with_context(|| format!("Failed to open {}", config.portal.start_url))?;

    let doc = CdpDocument::attach(page)
        .await
        .context("Failed to attach page event bridge")?;
    let session = PortalSession::start(Arc::new(doc), config);
    info!("Portal automation running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stopping");

    session.shutdown().await;
    Ok(())
}
