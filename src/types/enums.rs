//! Shared enum types that map directly to wire values.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Payload Format
// ---------------------------------------------------------------------------

/// Encoding of a streaming sub-message payload, as given by the format byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PayloadFormat {
    /// UTF-8 JSON (format byte 0).
    #[default]
    Json = 0,
    /// Protobuf-encoded message (format byte 1).
    Protobuf = 1,
}

impl PayloadFormat {
    /// Parse the format byte of a sub-message.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Json),
            1 => Some(Self::Protobuf),
            _ => None,
        }
    }

    /// The MIME type used in the `Format` field of a subscription request.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Protobuf => "application/x-protobuf",
        }
    }
}

impl Serialize for PayloadFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.mime_type())
    }
}

impl<'de> Deserialize<'de> for PayloadFormat {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "application/json" => Ok(Self::Json),
            "application/x-protobuf" => Ok(Self::Protobuf),
            other => Err(serde::de::Error::custom(format!("unknown payload format: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat Reason
// ---------------------------------------------------------------------------

/// Why the server sent a heartbeat for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeartbeatReason {
    /// No new data since the last update.
    NoNewData,
    /// The subscription is paused server side and will resume by itself.
    SubscriptionTemporarilyDisabled,
    /// The subscription will never deliver again and should be recreated.
    SubscriptionPermanentlyDisabled,
    /// A reason this client does not know about.
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Subscription State (REST)
// ---------------------------------------------------------------------------

/// State reported by the REST API for a created subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionStateCode {
    /// Streaming updates.
    Active,
    /// Created but paused.
    Suspended,
    /// A reason this client does not know about.
    #[serde(other)]
    Unknown,
}
