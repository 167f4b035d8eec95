//! Control-channel payloads (`_heartbeat`, `_resetsubscriptions`,
//! `_disconnect`).
//!
//! The server sends control payloads either as one object or as an array of
//! objects; [`ControlMessage::parse`] accepts both and folds them into one
//! tagged value.

use serde::Deserialize;
use serde_json::Value;

use crate::constants::{
    DISCONNECT_REFERENCE_ID, HEARTBEAT_REFERENCE_ID, RESET_SUBSCRIPTIONS_REFERENCE_ID,
};
use crate::types::enums::HeartbeatReason;

/// One entry of a `_heartbeat` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    /// The subscription the heartbeat is about.
    pub originating_reference_id: String,
    /// Why the heartbeat was sent.
    pub reason: HeartbeatReason,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HeartbeatBody {
    #[serde(default)]
    heartbeats: Vec<Heartbeat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResetSubscriptionsBody {
    #[serde(default)]
    target_reference_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(v) => v,
            Self::One(t) => vec![t],
        }
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Liveness signal; may name subscriptions without new data.
    Heartbeat(Vec<Heartbeat>),
    /// Tear down and recreate the named subscriptions. An empty list means
    /// every subscription on the connection.
    ResetSubscriptions {
        target_reference_ids: Vec<String>,
    },
    /// The server is closing the connection.
    Disconnect,
    /// A control reference id this client does not handle.
    Unknown(String),
}

impl ControlMessage {
    /// Decode the payload of a control sub-message with reference id
    /// `reference_id`.
    pub fn parse(reference_id: &str, payload: &Value) -> serde_json::Result<Self> {
        match reference_id {
            HEARTBEAT_REFERENCE_ID if payload.is_null() => Ok(Self::Heartbeat(Vec::new())),
            HEARTBEAT_REFERENCE_ID => {
                let bodies = OneOrMany::<HeartbeatBody>::deserialize(payload)?;
                Ok(Self::Heartbeat(
                    bodies
                        .into_vec()
                        .into_iter()
                        .flat_map(|b| b.heartbeats)
                        .collect(),
                ))
            }
            RESET_SUBSCRIPTIONS_REFERENCE_ID => {
                let bodies = OneOrMany::<ResetSubscriptionsBody>::deserialize(payload)?;
                let mut targets: Vec<String> = Vec::new();
                for id in bodies.into_vec().into_iter().flat_map(|b| b.target_reference_ids) {
                    if !targets.contains(&id) {
                        targets.push(id);
                    }
                }
                Ok(Self::ResetSubscriptions {
                    target_reference_ids: targets,
                })
            }
            DISCONNECT_REFERENCE_ID => Ok(Self::Disconnect),
            other => Ok(Self::Unknown(other.to_owned())),
        }
    }
}
