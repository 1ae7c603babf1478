//! Browser process lifecycle

mod wrapper;

pub use wrapper::{BrowserWrapper, launch_browser, open_page};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Failed to create page: {0}")]
    PageCreationFailed(String),

    #[error("Navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("Navigation to {url} timed out after {timeout_ms}ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },
}

pub type BrowserResult<T> = Result<T, BrowserError>;
