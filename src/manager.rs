//! Owns the browser for the portal session
//!
//! Uses `Arc<Mutex<Option<BrowserWrapper>>>`:
//! - lazy launch on first use
//! - health check on every access, relaunching a crashed browser
//! - explicit shutdown that closes Chrome, waits for it and cleans up
//!
//! The lock is `tokio::sync::Mutex` because it is held across CDP calls.

use anyhow::Result;
use chromiumoxide::page::Page;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::BrowserConfig;
use crate::browser::{BrowserError, BrowserResult, BrowserWrapper, launch_browser, open_page};

pub struct BrowserManager {
    config: BrowserConfig,
    browser: Arc<Mutex<Option<BrowserWrapper>>>,
}

impl BrowserManager {
    /// Browser is launched on the first `get_or_launch()` call
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: Arc::new(Mutex::new(None)),
        }
    }

    /// Return the running browser, launching or relaunching it as needed
    ///
    /// A browser that fails the `version()` health check is closed, its
    /// temporary profile removed, and a new one launched in its place.
    pub async fn get_or_launch(&self) -> Result<Arc<Mutex<Option<BrowserWrapper>>>> {
        let mut guard = self.browser.lock().await;

        if let Some(wrapper) = guard.as_ref() {
            match wrapper.browser().version().await {
                Ok(_) => {
                    debug!("Browser health check passed");
                    drop(guard);
                    return Ok(self.browser.clone());
                }
                Err(e) => {
                    warn!("Browser health check failed: {}. Relaunching", e);
                    if let Some(mut crashed) = guard.take() {
                        let _ = crashed.browser_mut().close().await;
                        let _ = crashed.browser_mut().wait().await;
                        crashed.cleanup_profile();
                    }
                }
            }
        }

        let wrapper = launch_browser(&self.config).await?;
        *guard = Some(wrapper);
        drop(guard);

        Ok(self.browser.clone())
    }

    /// Open `url` in the browser, launching it first if needed
    pub async fn open_page(&self, url: &str, timeout: Duration) -> BrowserResult<Page> {
        let browser = self
            .get_or_launch()
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;
        let guard = browser.lock().await;
        let wrapper = guard
            .as_ref()
            .ok_or_else(|| BrowserError::PageCreationFailed("Browser not available".into()))?;
        let page = open_page(wrapper, url, timeout).await?;
        info!(url, "Page opened");
        Ok(page)
    }

    /// Close Chrome and wait for it to exit. Safe to call more than once.
    ///
    /// Dropping the wrapper only aborts the handler task, which would leave
    /// the Chrome process behind, so close and wait come first.
    pub async fn shutdown(&self) -> Result<()> {
        let mut guard = self.browser.lock().await;

        if let Some(mut wrapper) = guard.take() {
            info!("Shutting down browser");

            if let Err(e) = wrapper.browser_mut().close().await {
                warn!("Failed to close browser cleanly: {}", e);
            }
            if let Err(e) = wrapper.browser_mut().wait().await {
                warn!("Failed to wait for browser exit: {}", e);
            }
            wrapper.cleanup_profile();
        }

        Ok(())
    }

    pub async fn is_browser_running(&self) -> bool {
        self.browser.lock().await.is_some()
    }
}
