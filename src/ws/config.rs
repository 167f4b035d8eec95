//! Streaming session configuration.

use serde::{Deserialize, Serialize};

use crate::constants::limits::{
    DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_RECONNECT_DELAY_MS,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RENEWAL_MARGIN_SECS,
};
use crate::constants::{SIM_API_BASE_URL, SIM_STREAMING_AUTHORIZE_URL, SIM_STREAMING_CONNECT_URL};

/// Configuration for a [`StreamingSession`](crate::ws::session::StreamingSession).
///
/// Every field has a default, so a config can be deserialized from a partial
/// document:
///
/// ```
/// use saxo_streaming::ws::config::StreamingConfig;
///
/// let config: StreamingConfig =
///     serde_json::from_str(r#"{ "context_id": "desk1", "reconnect_delay_ms": 250 }"#).unwrap();
/// assert_eq!(config.context_id, "desk1");
/// assert!(config.auto_reconnect);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Caller-chosen id scoping the connection's subscriptions.
    pub context_id: String,
    /// WebSocket connect endpoint.
    pub streaming_url: String,
    /// Endpoint used to re-authorize an open connection.
    pub authorize_url: String,
    /// REST gateway base URL used for subscriptions.
    pub rest_base_url: String,
    /// Whether to reconnect after a going-away or abnormal close.
    pub auto_reconnect: bool,
    /// Maximum consecutive reconnect attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt (milliseconds).
    pub reconnect_delay_ms: u64,
    /// Upper bound for the exponential reconnect delay (milliseconds).
    pub max_reconnect_delay_ms: u64,
    /// Growth factor between consecutive reconnect delays.
    pub backoff_multiplier: f64,
    /// Renew the token this many seconds before it expires.
    pub renewal_margin_secs: u64,
    /// Treat the connection as dead after this long without a frame
    /// (milliseconds, 0 disables).
    pub idle_timeout_ms: u64,
    /// Capacity of the session event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            context_id: default_context_id(),
            streaming_url: SIM_STREAMING_CONNECT_URL.to_owned(),
            authorize_url: SIM_STREAMING_AUTHORIZE_URL.to_owned(),
            rest_base_url: SIM_API_BASE_URL.to_owned(),
            auto_reconnect: true,
            max_reconnect_attempts: 0,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_reconnect_delay_ms: DEFAULT_MAX_RECONNECT_DELAY_MS,
            backoff_multiplier: 2.0,
            renewal_margin_secs: DEFAULT_RENEWAL_MARGIN_SECS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// A context id unique per process start, e.g. `ctx1718000000123`.
fn default_context_id() -> String {
    format!("ctx{}", chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_simulation() {
        let config = StreamingConfig::default();
        assert!(config.streaming_url.starts_with("wss://"));
        assert!(config.authorize_url.ends_with("/streamingws/authorize"));
        assert!(config.context_id.starts_with("ctx"));
        assert_eq!(config.renewal_margin_secs, 60);
        assert_eq!(config.max_reconnect_attempts, 0);
    }

    #[test]
    fn round_trips_through_json() {
        let config = StreamingConfig {
            context_id: "c1".into(),
            idle_timeout_ms: 0,
            ..StreamingConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: StreamingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.context_id, "c1");
        assert_eq!(back.idle_timeout_ms, 0);
    }
}
