//! Configuration for the relay service.
//!
//! # Example
//!
//! ```
//! use config_relay::ServiceConfig;
//!
//! // Minimal config (uses defaults)
//! let config = ServiceConfig::default();
//! assert_eq!(config.long_poll_timeout_ms, 60_000);
//!
//! // Full config
//! let config = ServiceConfig {
//!     listen_addr: "0.0.0.0:8080".into(),
//!     message_scan_interval_ms: 500,
//!     long_poll_timeout_ms: 30_000,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the relay service.
///
/// All fields have sensible defaults matching a single-node deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Bus scanner tick (ms)
    #[serde(default = "default_message_scan_interval_ms")]
    pub message_scan_interval_ms: u64,

    /// Message cache tail scan tick, until the bus takes over (ms)
    #[serde(default = "default_message_cache_scan_interval_ms")]
    pub message_cache_scan_interval_ms: u64,

    /// Namespace metadata tail scan tick (ms)
    #[serde(default = "default_meta_scan_interval_ms")]
    pub meta_scan_interval_ms: u64,

    /// Namespace metadata full rebuild tick (ms)
    #[serde(default = "default_meta_rebuild_interval_ms")]
    pub meta_rebuild_interval_ms: u64,

    /// Gray rule full rescan tick (ms)
    #[serde(default = "default_rule_scan_interval_ms")]
    pub rule_scan_interval_ms: u64,

    /// How long a long poll parks before answering not-modified (ms)
    #[serde(default = "default_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,

    /// Wakeups per batch when a message fans out to many waiters
    #[serde(default = "default_notification_batch")]
    pub notification_batch: usize,

    /// Pause between wakeup batches (ms)
    #[serde(default = "default_notification_batch_interval_ms")]
    pub notification_batch_interval_ms: u64,

    /// Release cache idle expiry (ms)
    #[serde(default = "default_release_cache_idle_ms")]
    pub release_cache_idle_ms: u64,

    /// Release cache janitor sweep tick (ms)
    #[serde(default = "default_release_cache_sweep_interval_ms")]
    pub release_cache_sweep_interval_ms: u64,
}

fn default_listen_addr() -> String { "127.0.0.1:8080".into() }
fn default_message_scan_interval_ms() -> u64 { 1_000 }
fn default_message_cache_scan_interval_ms() -> u64 { 1_000 }
fn default_meta_scan_interval_ms() -> u64 { 1_000 }
fn default_meta_rebuild_interval_ms() -> u64 { 60_000 }
fn default_rule_scan_interval_ms() -> u64 { 60_000 }
fn default_long_poll_timeout_ms() -> u64 { 60_000 }
fn default_notification_batch() -> usize { 100 }
fn default_notification_batch_interval_ms() -> u64 { 100 }
fn default_release_cache_idle_ms() -> u64 { 3_600_000 } // 1 hour
fn default_release_cache_sweep_interval_ms() -> u64 { 60_000 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            message_scan_interval_ms: default_message_scan_interval_ms(),
            message_cache_scan_interval_ms: default_message_cache_scan_interval_ms(),
            meta_scan_interval_ms: default_meta_scan_interval_ms(),
            meta_rebuild_interval_ms: default_meta_rebuild_interval_ms(),
            rule_scan_interval_ms: default_rule_scan_interval_ms(),
            long_poll_timeout_ms: default_long_poll_timeout_ms(),
            notification_batch: default_notification_batch(),
            notification_batch_interval_ms: default_notification_batch_interval_ms(),
            release_cache_idle_ms: default_release_cache_idle_ms(),
            release_cache_sweep_interval_ms: default_release_cache_sweep_interval_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn release_cache_idle(&self) -> Duration {
        Duration::from_millis(self.release_cache_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.long_poll_timeout_ms, 60_000);
        assert_eq!(config.notification_batch, 100);
        assert_eq!(config.release_cache_idle_ms, 3_600_000);
        assert_eq!(config.message_scan_interval_ms, 1_000);
    }

    #[test]
    fn partial_deserialization_fills_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"long_poll_timeout_ms": 5}"#).unwrap();
        assert_eq!(config.long_poll_timeout_ms, 5);
        assert_eq!(config.notification_batch, 100);
    }
}
