//! Constants for the OpenAPI streaming surface.
//!
//! Contains base URLs, control-channel reference ids, wire format sizes, and
//! default timings. These are used internally by
//! [`RestClient`](crate::client::RestClient) and the streaming session, but are
//! also exported for advanced usage.

// ---------------------------------------------------------------------------
// Base URLs
// ---------------------------------------------------------------------------

/// Base URL for the OpenAPI REST gateway (simulation environment).
pub const SIM_API_BASE_URL: &str = "https://gateway.saxobank.com/sim/openapi";

/// Base URL for the OpenAPI REST gateway (live environment).
pub const LIVE_API_BASE_URL: &str = "https://gateway.saxobank.com/openapi";

// ---------------------------------------------------------------------------
// Streaming URLs
// ---------------------------------------------------------------------------

/// WebSocket connect endpoint (simulation environment).
pub const SIM_STREAMING_CONNECT_URL: &str =
    "wss://streaming.saxobank.com/sim/openapi/streamingws/connect";

/// Re-authorization endpoint for an open streaming connection (simulation).
pub const SIM_STREAMING_AUTHORIZE_URL: &str =
    "https://streaming.saxobank.com/sim/openapi/streamingws/authorize";

/// WebSocket connect endpoint (live environment).
pub const LIVE_STREAMING_CONNECT_URL: &str =
    "wss://streaming.saxobank.com/openapi/streamingws/connect";

/// Re-authorization endpoint for an open streaming connection (live).
pub const LIVE_STREAMING_AUTHORIZE_URL: &str =
    "https://streaming.saxobank.com/openapi/streamingws/authorize";

// ---------------------------------------------------------------------------
// Control reference ids
// ---------------------------------------------------------------------------

/// Prefix shared by every control-channel reference id.
pub const CONTROL_PREFIX: char = '_';

/// Liveness signal sent when a subscription has had no new data.
pub const HEARTBEAT_REFERENCE_ID: &str = "_heartbeat";

/// Server asks the client to tear down and recreate subscriptions.
pub const RESET_SUBSCRIPTIONS_REFERENCE_ID: &str = "_resetsubscriptions";

/// Server is closing the connection; the client must re-authenticate.
pub const DISCONNECT_REFERENCE_ID: &str = "_disconnect";

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Sizes of the fixed-width fields of one sub-message.
pub mod wire {
    /// Little-endian message id.
    pub const MESSAGE_ID_LEN: usize = 8;
    /// Reserved / version field, ignored.
    pub const RESERVED_LEN: usize = 2;
    /// Reference id length prefix.
    pub const REFERENCE_ID_LEN_LEN: usize = 1;
    /// Payload format byte.
    pub const PAYLOAD_FORMAT_LEN: usize = 1;
    /// Little-endian payload length.
    pub const PAYLOAD_LEN_LEN: usize = 4;
    /// Bytes of one sub-message that precede the reference id.
    pub const PREFIX_LEN: usize = MESSAGE_ID_LEN + RESERVED_LEN + REFERENCE_ID_LEN_LEN;
}

// ---------------------------------------------------------------------------
// Limits & defaults
// ---------------------------------------------------------------------------

/// Identifier and timing limits.
pub mod limits {
    /// Maximum length of a context id or reference id.
    pub const MAX_ID_LEN: usize = 50;

    /// Renew the token this many seconds before it expires.
    pub const DEFAULT_RENEWAL_MARGIN_SECS: u64 = 60;

    /// Initial reconnect delay in milliseconds.
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

    /// Upper bound for the exponential reconnect delay.
    pub const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;

    /// Reconnect if nothing (data or heartbeat) arrives for this long.
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 120_000;

    /// Capacity of the session event broadcast channel.
    pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

    /// Capacity of the command channel between handles and the session task.
    pub const COMMAND_CHANNEL_CAPACITY: usize = 64;
}
