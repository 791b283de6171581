//! Ticket flow manager configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the ticket flow manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Enable/disable the background progress loop.
    /// When disabled, approval flows only advance through explicit API calls.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often running approval flows are re-checked (milliseconds).
    #[serde(default = "default_approval_interval")]
    pub approval_poll_interval_ms: u64,

    /// External call retries before a flow is marked failed.
    #[serde(default = "default_retry_limit")]
    pub external_retry_limit: u32,

    /// Wait between external call retries (milliseconds).
    #[serde(default = "default_retry_backoff")]
    pub external_retry_backoff_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_approval_interval() -> u64 {
    5000 // 5 seconds
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    2000 // 2 seconds
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            approval_poll_interval_ms: default_approval_interval(),
            external_retry_limit: default_retry_limit(),
            external_retry_backoff_ms: default_retry_backoff(),
        }
    }
}
