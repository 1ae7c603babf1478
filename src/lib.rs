//! Portal automation over the Chrome DevTools Protocol
//!
//! Waits for a reactive single-page portal to render, then drives it: custom
//! tab titles on case and alert pages, a one-click "assign case to me"
//! flow that fills framework-controlled form fields the framework accepts,
//! and a right-click lookup menu for IPs, hashes and event ids.

mod browser;
pub mod browser_setup;
pub mod components;
pub mod dom;
pub mod engine;
mod manager;
pub mod runtime;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

use components::{CaseAssignmentConfig, ContextMenuConfig, TabTitleConfig};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "PORTAL_AUTOMATION_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid poll policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub portal: PortalConfig,

    #[serde(default)]
    pub case_assignment: CaseAssignmentConfig,

    #[serde(default)]
    pub tab_title: TabTitleConfig,

    #[serde(default)]
    pub context_menu: ContextMenuConfig,
}

/// Browser security and launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Run browser in headless mode. The trigger button and alerts are only
    /// useful to someone looking at the window.
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Disable web security features (Same-Origin Policy, etc.)
    /// WARNING: Only enable for trusted content
    #[serde(default = "default_disable_security")]
    pub disable_security: bool,

    /// Persistent profile directory, so the portal session survives
    /// restarts. A throwaway profile is used when unset.
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,

    /// Window dimensions
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,

    #[serde(default = "default_window_height")]
    pub height: u32,
}

/// Where the portal lives and how its pages are recognised
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Page opened at startup
    #[serde(default = "default_start_url")]
    pub start_url: String,

    #[serde(default = "default_case_prefix")]
    pub case_prefix: String,

    #[serde(default = "default_alert_prefix")]
    pub alert_prefix: String,

    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
}

fn default_headless() -> bool {
    false
}

fn default_disable_security() -> bool {
    false
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    720
}

fn default_start_url() -> String {
    "https://portal.agileblue.com/apps/".to_string()
}

fn default_case_prefix() -> String {
    "https://portal.agileblue.com/apps/case/".to_string()
}

fn default_alert_prefix() -> String {
    "https://portal.agileblue.com/apps/alert/".to_string()
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            disable_security: default_disable_security(),
            profile_dir: None,
            window: WindowConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            start_url: default_start_url(),
            case_prefix: default_case_prefix(),
            alert_prefix: default_alert_prefix(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
        }
    }
}

impl Config {
    /// Check everything that would otherwise only fail mid-run
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.portal.start_url).map_err(|e| {
            ConfigError::Invalid(format!("portal.start_url '{}': {}", self.portal.start_url, e))
        })?;
        if self.portal.navigation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "portal.navigation_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.case_assignment.validate()?;
        self.tab_title.validate()?;
        self.context_menu.validate()?;
        Ok(())
    }
}

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config.yaml"))
}

/// Load config from `$PORTAL_AUTOMATION_CONFIG`, else config.yaml in the
/// package root, else defaults
pub fn load_yaml_config() -> Result<Config, ConfigError> {
    let config_path = config_path();

    let config = if config_path.exists() {
        let contents = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        parse_config(&contents).map_err(|source| ConfigError::Yaml {
            path: config_path,
            source,
        })?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config, serde_yaml::Error> {
    serde_yaml::from_str(contents)
}

pub use browser::{BrowserError, BrowserResult};
pub use browser_setup::{download_managed_browser, find_browser_executable};
pub use manager::BrowserManager;
pub use runtime::PortalSession;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PollPolicy;

    #[test]
    fn empty_file_gives_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.case_assignment, CaseAssignmentConfig::default());
        assert_eq!(config.context_menu, ContextMenuConfig::default());
        assert!(!config.browser.headless);
        assert!(!config.browser.disable_security);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sections_override_independently() {
        let config = parse_config(
            r#"
portal:
  start_url: https://portal.test/apps/
  case_prefix: https://portal.test/apps/case/
case_assignment:
  note_text: Taking this one.
  form_poll:
    max_attempts: 40
tab_title:
  enabled: false
"#,
        )
        .unwrap();

        assert_eq!(config.portal.case_prefix, "https://portal.test/apps/case/");
        assert_eq!(config.portal.alert_prefix, default_alert_prefix());
        assert_eq!(config.case_assignment.note_text, "Taking this one.");
        assert_eq!(config.case_assignment.form_poll, PollPolicy::new(40, 500));
        assert_eq!(config.case_assignment.user_name_selector, "p.username");
        assert!(!config.tab_title.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let config = parse_config(
            r#"
tab_title:
  case_poll:
    interval_ms: 0
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn context_menu_lookups_are_configurable() {
        let config = parse_config(
            r#"
context_menu:
  tab_stagger_ms: 50
  lookups:
    sha256:
      - https://intel.test/file/{value}
"#,
        )
        .unwrap();
        assert_eq!(config.context_menu.tab_stagger_ms, 50);
        assert_eq!(config.context_menu.lookups.sha256, vec!["https://intel.test/file/{value}"]);
        assert_eq!(config.context_menu.lookups.ip.len(), 3);
        assert_eq!(config.context_menu.menu_id, "analyzer-menu");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_indicator_pattern_is_rejected() {
        let config = parse_config(
            r#"
context_menu:
  patterns:
    ipv4: "(unclosed"
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_start_url_is_rejected() {
        let mut config = Config::default();
        config.portal.start_url = "not a url".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
