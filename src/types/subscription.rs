#![allow(missing_docs)]
//! Subscription request/response types for the REST control surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{CONTROL_PREFIX, limits::MAX_ID_LEN};
use crate::error::{Result, StreamingError};
use crate::types::enums::{PayloadFormat, SubscriptionStateCode};

// ---------------------------------------------------------------------------
// Subscription spec
// ---------------------------------------------------------------------------

/// Everything needed to create (and later recreate) one streaming
/// subscription.
///
/// ```
/// use saxo_streaming::types::subscription::SubscriptionSpec;
/// use serde_json::json;
///
/// let spec = SubscriptionSpec::new(
///     "/trade/v1/infoprices/subscriptions",
///     json!({ "Uic": 21, "AssetType": "FxSpot" }),
/// )
/// .refresh_rate(1000);
/// assert_eq!(spec.refresh_rate, Some(1000));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    /// Service path of the subscription resource,
    /// e.g. `/trade/v1/infoprices/subscriptions`.
    pub service_path: String,
    /// Service specific `Arguments` object.
    pub arguments: Value,
    /// Requested payload encoding.
    pub format: PayloadFormat,
    /// Minimum milliseconds between updates.
    pub refresh_rate: Option<u32>,
    /// Tag used to group subscriptions server side.
    pub tag: Option<String>,
}

impl SubscriptionSpec {
    /// A JSON subscription on `service_path` with the given arguments.
    pub fn new(service_path: impl Into<String>, arguments: Value) -> Self {
        Self {
            service_path: service_path.into().trim_end_matches('/').to_owned(),
            arguments,
            format: PayloadFormat::Json,
            refresh_rate: None,
            tag: None,
        }
    }

    /// Request Protobuf payloads instead of JSON.
    pub fn format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the refresh rate in milliseconds.
    pub fn refresh_rate(mut self, ms: u32) -> Self {
        self.refresh_rate = Some(ms);
        self
    }

    /// Set the subscription tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Build the request body for this spec.
    pub fn to_request(&self, context_id: &str, reference_id: &str) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            context_id: context_id.to_owned(),
            reference_id: reference_id.to_owned(),
            arguments: self.arguments.clone(),
            format: Some(self.format),
            refresh_rate: self.refresh_rate,
            tag: self.tag.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// Request body for `POST {service_path}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateSubscriptionRequest {
    pub context_id: String,
    pub reference_id: String,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<PayloadFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Response of a successful subscription creation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionResponse {
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub state: Option<SubscriptionStateCode>,
    /// Seconds without data after which the server sends a heartbeat.
    #[serde(default)]
    pub inactivity_timeout: Option<u32>,
    #[serde(default)]
    pub refresh_rate: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
    /// Protobuf schema name, for Protobuf subscriptions.
    #[serde(default)]
    pub schema_name: Option<String>,
    /// Initial state the streamed deltas apply to.
    #[serde(default)]
    pub snapshot: Option<Value>,
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

/// Validate a context id: 1–50 chars of `[A-Za-z0-9_-]`.
pub fn validate_context_id(id: &str) -> Result<()> {
    validate_id("context id", id)
}

/// Validate an application reference id: like a context id, and it must not
/// collide with the control-channel prefix.
pub fn validate_reference_id(id: &str) -> Result<()> {
    validate_id("reference id", id)?;
    if id.starts_with(CONTROL_PREFIX) {
        return Err(StreamingError::InvalidArgument(format!(
            "reference id {id:?} must not start with {CONTROL_PREFIX:?}"
        )));
    }
    Ok(())
}

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(StreamingError::InvalidArgument(format!(
            "{kind} must be 1-{MAX_ID_LEN} characters, got {}",
            id.len()
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(StreamingError::InvalidArgument(format!(
            "{kind} {id:?} contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_pascal_case() {
        let spec = SubscriptionSpec::new("/trade/v1/infoprices/subscriptions/", json!({"Uic": 21}))
            .refresh_rate(500);
        let body = serde_json::to_value(spec.to_request("ctx1", "prices")).unwrap();
        assert_eq!(
            body,
            json!({
                "ContextId": "ctx1",
                "ReferenceId": "prices",
                "Arguments": {"Uic": 21},
                "Format": "application/json",
                "RefreshRate": 500
            })
        );
        assert_eq!(spec.service_path, "/trade/v1/infoprices/subscriptions");
    }

    #[test]
    fn response_tolerates_missing_fields() {
        let resp: SubscriptionResponse =
            serde_json::from_str(r#"{"ReferenceId":"p","State":"Active","Snapshot":{"Quote":{}}}"#)
                .unwrap();
        assert_eq!(resp.state, Some(SubscriptionStateCode::Active));
        assert!(resp.snapshot.is_some());
        assert!(resp.inactivity_timeout.is_none());
    }

    #[test]
    fn reference_id_rules() {
        assert!(validate_reference_id("MyChartDataEvent").is_ok());
        assert!(validate_reference_id("_heartbeat").is_err());
        assert!(validate_reference_id("").is_err());
        assert!(validate_reference_id(&"a".repeat(51)).is_err());
        assert!(validate_reference_id("has space").is_err());
        assert!(validate_context_id("_ctx-1").is_ok());
    }
}
