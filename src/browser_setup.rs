use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, trace, warn};

use crate::BrowserConfig;

/// Environment variable that overrides executable discovery
pub const CHROMIUM_PATH_ENV: &str = "CHROMIUM_PATH";

/// Chrome profile used by one browser instance
///
/// A persistent profile keeps the portal login between runs and is never
/// deleted. A temporary one is unique to this process and removed after the
/// browser exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    Temporary(PathBuf),
    Persistent(PathBuf),
}

impl Profile {
    pub fn for_config(config: &BrowserConfig) -> Self {
        match &config.profile_dir {
            Some(dir) => Profile::Persistent(dir.clone()),
            None => Profile::Temporary(
                std::env::temp_dir().join(format!("portal_automation_{}", std::process::id())),
            ),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Profile::Temporary(path) | Profile::Persistent(path) => path,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Profile::Temporary(_))
    }
}

/// Removes a freshly created temporary profile if launch fails before the
/// browser takes it over
struct ProfileGuard {
    profile: Profile,
    armed: bool,
}

impl ProfileGuard {
    fn create(profile: Profile) -> Result<Self> {
        std::fs::create_dir_all(profile.path()).with_context(|| {
            format!("Failed to create profile directory {}", profile.path().display())
        })?;
        Ok(Self {
            profile,
            armed: true,
        })
    }

    /// Launch succeeded; the caller owns cleanup from here
    fn release(mut self) -> Profile {
        self.armed = false;
        self.profile.clone()
    }
}

impl Drop for ProfileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Profile::Temporary(path) = &self.profile {
            match std::fs::remove_dir_all(path) {
                Ok(()) => info!("Cleaned up profile after launch failure: {}", path.display()),
                Err(e) => warn!("Failed to clean up profile {}: {}", path.display(), e),
            }
        }
    }
}

fn candidate_paths() -> &'static [&'static str] {
    if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"%LOCALAPPDATA%\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "~/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    }
}

fn expand_candidate(candidate: &str) -> Option<PathBuf> {
    if let Some(rest) = candidate.strip_prefix("~/") {
        dirs::home_dir().map(|home| home.join(rest))
    } else if candidate.contains('%') {
        Some(PathBuf::from(expand_windows_env_vars(candidate)))
    } else {
        Some(PathBuf::from(candidate))
    }
}

/// Find an installed Chrome/Chromium: `$CHROMIUM_PATH`, then the usual
/// install locations, then `which` on Unix
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CHROMIUM_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from {}: {}", CHROMIUM_PATH_ENV, path.display());
            return Ok(path);
        }
        warn!("{} points to a missing file: {}", CHROMIUM_PATH_ENV, path.display());
    }

    if let Some(path) = candidate_paths()
        .iter()
        .filter_map(|candidate| expand_candidate(candidate))
        .find(|path| path.exists())
    {
        info!("Found browser at: {}", path.display());
        return Ok(path);
    }

    if !cfg!(target_os = "windows") {
        for cmd in ["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    info!("Found browser using 'which {}': {}", cmd, found);
                    return Ok(PathBuf::from(found));
                }
            }
        }
    }

    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Expand `%VAR%` tokens. Unknown variables are left as written.
fn expand_windows_env_vars(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut chars = path.chars();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            result.push(ch);
            continue;
        }
        let var_name: String = chars.by_ref().take_while(|&c| c != '%').collect();
        if var_name.is_empty() {
            result.push('%');
        } else if let Ok(value) = std::env::var(&var_name) {
            result.push_str(&value);
        } else {
            result.push('%');
            result.push_str(&var_name);
            result.push('%');
        }
    }

    result
}

/// Download a Chromium build into the user cache and return its executable
pub async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(|| {
            let fallback = std::env::temp_dir().join(".cache");
            warn!(
                "No system cache directory, downloading into {}",
                fallback.display()
            );
            fallback
        })
        .join("portal-automation/chromium");
    info!("Downloading managed Chromium into {}", cache_dir.display());

    std::fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("Failed to build fetcher options")?,
    );
    let revision_info = fetcher.fetch().await.context("Failed to fetch browser")?;

    info!("Downloaded Chromium to: {}", revision_info.folder_path.display());
    Ok(revision_info.executable_path)
}

/// Errors the CDP handler reports for events chromiumoxide cannot decode.
/// They do not affect the session.
/// See https://github.com/mattsse/chromiumoxide/issues/167
fn is_benign_handler_error(message: &str) -> bool {
    message.contains("data did not match any variant of untagged enum Message")
        || message.contains("Failed to deserialize WS response")
}

/// Find (or download) Chrome and launch it for an interactive portal session
///
/// The returned handler task drives the CDP connection and must be aborted
/// when the browser is done with; `BrowserWrapper` does that on drop.
pub async fn launch_browser(config: &BrowserConfig) -> Result<(Browser, JoinHandle<()>, Profile)> {
    let chrome_path = match find_browser_executable().await {
        Ok(path) => path,
        Err(e) => {
            warn!("{}. Falling back to a managed download.", e);
            download_managed_browser().await?
        }
    };

    let guard = ProfileGuard::create(Profile::for_config(config))?;

    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(config.window.width, config.window.height)
        .user_data_dir(guard.profile.path())
        .chrome_executable(chrome_path);

    builder = if config.headless {
        builder.headless_mode(HeadlessMode::default())
    } else {
        builder.with_head()
    };

    builder = builder
        .arg("--disable-infobars")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-renderer-backgrounding")
        .arg("--password-store=basic");

    if config.disable_security {
        warn!("Disabling browser security features (disable_security=true)");
        builder = builder
            .arg("--disable-web-security")
            .arg("--disable-features=IsolateOrigins,site-per-process")
            .arg("--ignore-certificate-errors");
    }

    if should_disable_sandbox() || config.disable_security {
        info!("Disabling Chrome sandbox");
        builder = builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
    }

    let browser_config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    info!("Launching browser with config: {:?}", browser_config);
    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("Failed to launch browser")?;

    let handler_task = task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                let message = e.to_string();
                if is_benign_handler_error(&message) {
                    trace!("Suppressed benign CDP error: {}", message);
                } else {
                    error!("Browser handler error: {:?}", e);
                }
            }
        }
        info!("Browser handler task completed");
    });

    Ok((browser, handler_task, guard.release()))
}

/// Containers cannot use the setuid sandbox
fn should_disable_sandbox() -> bool {
    Path::new("/.dockerenv").exists()
        || std::env::var("container").is_ok()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}
