//! Launched browser plus the task driving its CDP connection

use anyhow::Result;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{BrowserError, BrowserResult};
use crate::BrowserConfig;
use crate::browser_setup::Profile;

/// Browser with its handler task and profile
///
/// Dropping aborts the handler. Close the browser and call
/// [`BrowserWrapper::cleanup_profile`] first for a clean exit.
pub struct BrowserWrapper {
    browser: Browser,
    handler: JoinHandle<()>,
    profile: Option<Profile>,
}

impl BrowserWrapper {
    pub(crate) fn new(browser: Browser, handler: JoinHandle<()>, profile: Profile) -> Self {
        Self {
            browser,
            handler,
            profile: Some(profile),
        }
    }

    pub(crate) fn browser(&self) -> &Browser {
        &self.browser
    }

    pub(crate) fn browser_mut(&mut self) -> &mut Browser {
        &mut self.browser
    }

    /// Remove a temporary profile; persistent ones are left alone
    ///
    /// Call only after `browser.wait()` so Chrome has released its files.
    pub fn cleanup_profile(&mut self) {
        match self.profile.take() {
            Some(Profile::Temporary(path)) => {
                info!("Cleaning up temporary profile: {}", path.display());
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(
                        "Failed to clean up profile {}: {}. Manual cleanup may be required.",
                        path.display(),
                        e
                    );
                }
            }
            Some(Profile::Persistent(path)) => {
                info!("Keeping persistent profile: {}", path.display());
            }
            None => {}
        }
    }
}

impl Drop for BrowserWrapper {
    fn drop(&mut self) {
        self.handler.abort();
        if let Some(Profile::Temporary(path)) = &self.profile {
            warn!(
                "BrowserWrapper dropped without shutdown, temporary profile left at {}",
                path.display()
            );
        }
    }
}

/// Launch a browser for `config`
pub async fn launch_browser(config: &BrowserConfig) -> Result<BrowserWrapper> {
    info!(headless = config.headless, "Launching browser");
    let (browser, handler, profile) = crate::browser_setup::launch_browser(config).await?;
    Ok(BrowserWrapper::new(browser, handler, profile))
}

/// Open `url` in the first tab (or a new one) and wait for it to load
pub async fn open_page(wrapper: &BrowserWrapper, url: &str, timeout: Duration) -> BrowserResult<Page> {
    let browser = wrapper.browser();
    let existing = browser
        .pages()
        .await
        .map_err(|e| BrowserError::PageCreationFailed(e.to_string()))?;

    let navigate = async {
        let page = match existing.into_iter().next() {
            Some(page) => {
                page.goto(url).await.map_err(|e| BrowserError::NavigationFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
                page
            }
            None => browser
                .new_page(url)
                .await
                .map_err(|e| BrowserError::PageCreationFailed(e.to_string()))?,
        };
        page.wait_for_navigation()
            .await
            .map_err(|e| BrowserError::NavigationFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok::<_, BrowserError>(page)
    };

    match tokio::time::timeout(timeout, navigate).await {
        Ok(result) => result,
        Err(_) => Err(BrowserError::NavigationTimeout {
            url: url.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
