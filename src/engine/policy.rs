//! Polling bounds and their validation

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Longest wait a single poll may describe (5 minutes)
/// Covers the slowest case pages, which render thousands of alerts first
pub const MAX_POLL_WAIT_MS: u64 = 300_000;

/// Bound on a readiness wait: `max_attempts` evaluations, `interval_ms` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    20
}

fn default_interval_ms() -> u64 {
    500
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl PollPolicy {
    pub const fn new(max_attempts: u32, interval_ms: u64) -> Self {
        Self {
            max_attempts,
            interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Nominal budget, `max_attempts * interval_ms`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(u64::from(self.max_attempts)))
    }

    /// Reject policies that would never evaluate, spin, or wait unreasonably long
    ///
    /// # Example
    /// ```rust
    /// use portal_automation::engine::PollPolicy;
    ///
    /// assert!(PollPolicy::new(20, 500).validate("form").is_ok());
    /// assert!(PollPolicy::new(0, 500).validate("form").is_err());
    /// ```
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        self.check_bounds().map_err(|reason| ConfigError::InvalidPolicy {
            name: name.to_string(),
            reason,
        })
    }

    /// Same rules as [`PollPolicy::validate`], for policies that arrive
    /// outside the config file
    pub fn check_bounds(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.interval_ms == 0 {
            return Err("interval_ms must be greater than 0".to_string());
        }
        let total = self.timeout().as_millis();
        if total > u128::from(MAX_POLL_WAIT_MS) {
            return Err(format!(
                "total wait cannot exceed {}ms ({} minutes). Received: {}ms",
                MAX_POLL_WAIT_MS,
                MAX_POLL_WAIT_MS / 60_000,
                total
            ));
        }
        Ok(())
    }
}
