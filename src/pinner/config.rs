//! Pinner configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::Backoff;

/// Pinner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnerConfig {
    /// First backpressure retry delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Cap on the backpressure retry delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Geometric growth factor between retries
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Self-imposed deadline per outstanding resolver request, milliseconds
    #[serde(default = "default_resolver_timeout_ms")]
    pub resolver_timeout_ms: u64,

    /// Whether this run follows a previous run of the same workflow; a
    /// restarted pinner rehydrates from the store before serving
    #[serde(default)]
    pub is_restart: bool,
}

fn default_backoff_initial_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_resolver_timeout_ms() -> u64 {
    30_000
}

impl Default for PinnerConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            resolver_timeout_ms: default_resolver_timeout_ms(),
            is_restart: false,
        }
    }
}

impl PinnerConfig {
    /// Get the resolver timeout as a Duration
    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver_timeout_ms)
    }

    /// A fresh backoff sequence for one in-flight reference
    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_multiplier,
        )
    }
}
