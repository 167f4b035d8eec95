//! Error types for the `saxo-streaming` crate.
//!
//! All fallible operations in this crate return [`Result<T>`], which is an
//! alias for `std::result::Result<T, StreamingError>`.
//!
//! [`StreamingError`] covers:
//! - **Framing errors**: a binary frame whose declared lengths overrun the buffer
//! - **Payload errors**: one sub-message whose JSON/Protobuf body failed to decode
//! - **Unsupported formats**: a payload format byte other than JSON or Protobuf
//! - **API errors**: structured error responses from the REST control surface
//! - **HTTP / WebSocket transport errors**
//! - **Token renewal failures**
//! - **Invalid arguments**: client-side validation errors

use std::fmt;

/// Error response returned by the OpenAPI REST endpoints.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiErrorBody {
    /// Error code (e.g. "InvalidRequest", "SubscriptionLimitExceeded").
    #[serde(default)]
    pub error_code: Option<String>,
    /// Human-readable description of the error.
    #[serde(default)]
    pub message: Option<String>,
}

impl fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.error_code.as_deref().unwrap_or("UNKNOWN"),
            self.message.as_deref().unwrap_or("No message"),
        )
    }
}

/// All possible errors produced by the streaming client.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// The frame layout is inconsistent with its declared lengths. Fatal to
    /// the whole frame.
    #[error("framing error: {field} at offset {offset} needs {needed} bytes, {available} available")]
    Framing {
        /// Which field was being read.
        field: &'static str,
        /// Byte offset of the field within the frame.
        offset: usize,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes left in the frame at `offset`.
        available: usize,
    },

    /// A single sub-message payload could not be decoded.
    #[error("payload decode error for {reference_id} (message {message_id}): {reason}")]
    PayloadDecode {
        /// Message id of the skipped sub-message.
        message_id: u64,
        /// Reference id of the skipped sub-message.
        reference_id: String,
        /// Decoder error text.
        reason: String,
    },

    /// A sub-message declared a payload format this client cannot decode.
    #[error("unsupported payload format {format} for {reference_id} (message {message_id})")]
    UnsupportedFormat {
        /// Message id of the skipped sub-message.
        message_id: u64,
        /// Reference id of the skipped sub-message.
        reference_id: String,
        /// Raw format byte.
        format: u8,
    },

    /// A message arrived for a reference id nobody is subscribed to.
    #[error("no subscriber for reference id {reference_id} (message {message_id})")]
    UnroutableReference {
        /// The unknown reference id.
        reference_id: String,
        /// Message id of the dropped message.
        message_id: u64,
    },

    /// An error response returned by the REST API.
    #[error("API error (HTTP {status}): {body}")]
    Api {
        /// The HTTP status code.
        status: reqwest::StatusCode,
        /// The structured error body.
        body: ApiErrorBody,
    },

    /// The server returned an unexpected HTTP status code.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: reqwest::StatusCode,
        /// The response body text.
        body: String,
    },

    /// A network or transport-level error from `reqwest`.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A WebSocket-level error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// An error building or parsing a URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Renewing the streaming authorization failed.
    #[error("token renewal failed: {0}")]
    Renewal(String),

    /// The streaming session task is no longer running.
    #[error("streaming session closed")]
    SessionClosed,

    /// The caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamingError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl StreamingError {
    /// Whether this error was produced by a REST call rejected with 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } | Self::Api { status, .. } => {
                *status == reqwest::StatusCode::NOT_FOUND
            }
            _ => false,
        }
    }

    /// Whether the streaming handshake was rejected because the token is not
    /// (or no longer) valid.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } | Self::Api { status, .. } => {
                *status == reqwest::StatusCode::UNAUTHORIZED
            }
            Self::WebSocket(e) => matches!(
                e.as_ref(),
                tokio_tungstenite::tungstenite::Error::Http(resp)
                    if resp.status().as_u16() == 401
            ),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamingError>;
