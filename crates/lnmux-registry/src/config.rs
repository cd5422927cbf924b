//! Registry configuration loading and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::RegistryError;

/// Tunables of the invoice registry.
///
/// The clock is not part of the configuration; it is injected when the
/// registry is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Minimum number of blocks between the current height and an HTLC's
    /// expiry for the HTLC to be accepted.
    #[serde(default = "default_final_cltv_reject_delta")]
    pub final_cltv_reject_delta: u32,

    /// How long a partially paid invoice may hold its HTLCs.
    #[serde(default = "default_htlc_hold_duration_ms")]
    pub htlc_hold_duration_ms: u64,

    /// Time from the first accepted HTLC until a fully paid hold invoice
    /// must be settled.
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// Upper bound on how long the decision loop sleeps between deadline checks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Capacity of the command channel into the decision loop.
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,

    /// Capacity of each subscription's delivery queue.
    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,
}

fn default_final_cltv_reject_delta() -> u32 {
    10
}
fn default_htlc_hold_duration_ms() -> u64 {
    30_000
}
fn default_accept_timeout_ms() -> u64 {
    60_000
}
fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_command_queue_depth() -> usize {
    256
}
fn default_subscriber_queue_depth() -> usize {
    64
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            final_cltv_reject_delta: default_final_cltv_reject_delta(),
            htlc_hold_duration_ms: default_htlc_hold_duration_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            command_queue_depth: default_command_queue_depth(),
            subscriber_queue_depth: default_subscriber_queue_depth(),
        }
    }
}

impl RegistryConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, RegistryError> {
        let config: Self = toml::from_str(s).map_err(|e| RegistryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Check the configuration for values the registry cannot run with.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.command_queue_depth == 0 || self.subscriber_queue_depth == 0 {
            return Err(RegistryError::Config("queue depths must be non-zero".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(RegistryError::Config("tick_interval_ms must be non-zero".into()));
        }
        if self.accept_timeout_ms < self.htlc_hold_duration_ms {
            return Err(RegistryError::Config(
                "accept_timeout_ms must not be shorter than htlc_hold_duration_ms".into(),
            ));
        }
        self.hold_delta()?;
        self.accept_delta()?;
        Ok(())
    }

    pub fn htlc_hold_duration(&self) -> Duration {
        Duration::from_millis(self.htlc_hold_duration_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub(crate) fn hold_delta(&self) -> Result<chrono::Duration, RegistryError> {
        chrono::Duration::from_std(self.htlc_hold_duration())
            .map_err(|e| RegistryError::Config(format!("htlc_hold_duration_ms: {}", e)))
    }

    pub(crate) fn accept_delta(&self) -> Result<chrono::Duration, RegistryError> {
        chrono::Duration::from_std(self.accept_timeout())
            .map_err(|e| RegistryError::Config(format!("accept_timeout_ms: {}", e)))
    }
}
