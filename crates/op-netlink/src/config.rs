//! Connection configuration
//!
//! Defaults can be overridden from the environment:
//!
//! | Variable              | Field                |
//! |-----------------------|----------------------|
//! | `OP_ODP_MAX_BATCH`    | `max_batch_size`     |
//! | `OP_ODP_BYPASS_QUEUE` | `bypass_send_queue`  |
//! | `OP_ODP_TIMEOUT_MS`   | `request_timeout_ms` |
//! | `OP_ODP_RECV_BUFFER`  | `recv_buffer_size`   |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::DEFAULT_MAX_BATCH_SIZE;

pub const ENV_MAX_BATCH: &str = "OP_ODP_MAX_BATCH";
pub const ENV_BYPASS_QUEUE: &str = "OP_ODP_BYPASS_QUEUE";
pub const ENV_TIMEOUT_MS: &str = "OP_ODP_TIMEOUT_MS";
pub const ENV_RECV_BUFFER: &str = "OP_ODP_RECV_BUFFER";

/// Configuration for a netlink connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Messages coalesced into one write
    pub max_batch_size: usize,
    /// Write every submission immediately
    pub bypass_send_queue: bool,
    /// Per-request deadline in milliseconds (0 disables)
    pub request_timeout_ms: u64,
    /// Datagram receive buffer size
    pub recv_buffer_size: usize,
    /// Datagrams read per read event before yielding
    pub max_reads_per_event: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            bypass_send_queue: false,
            request_timeout_ms: 5000,
            recv_buffer_size: 64 * 1024,
            max_reads_per_event: 64,
        }
    }
}

impl ConnectionConfig {
    /// Defaults overlaid with the `OP_ODP_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    /// Unparsable values keep the default; sizes are clamped to sane minimums.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(n) = number(ENV_MAX_BATCH) {
            config.max_batch_size = (n as usize).max(1);
        }
        if let Some(v) = lookup(ENV_BYPASS_QUEUE) {
            config.bypass_send_queue =
                matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on");
        }
        if let Some(ms) = number(ENV_TIMEOUT_MS) {
            config.request_timeout_ms = ms;
        }
        if let Some(n) = number(ENV_RECV_BUFFER) {
            config.recv_buffer_size = (n as usize).max(4096);
        }
        debug!(?config, "Loaded connection configuration");
        config
    }

    /// Request deadline, `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert!(!config.bypass_send_queue);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = ConnectionConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"max_batch_size": 4, "bypass_send_queue": true}"#).unwrap();
        assert_eq!(config.max_batch_size, 4);
        assert!(config.bypass_send_queue);
        assert_eq!(config.recv_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_environment_overrides() {
        let config = ConnectionConfig::from_lookup(|key| match key {
            ENV_MAX_BATCH => Some("0".into()),
            ENV_BYPASS_QUEUE => Some(" Yes ".into()),
            ENV_TIMEOUT_MS => Some(" 250 ".into()),
            ENV_RECV_BUFFER => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(config.max_batch_size, 1);
        assert!(config.bypass_send_queue);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.recv_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_small_recv_buffer_is_clamped() {
        let config = ConnectionConfig::from_lookup(|key| {
            (key == ENV_RECV_BUFFER).then(|| "512".to_string())
        });
        assert_eq!(config.recv_buffer_size, 4096);
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
    }
}
