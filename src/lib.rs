//! # saxo-streaming
//!
//! A Rust client for the [Saxo OpenAPI](https://www.developer.saxo/openapi/learn)
//! streaming WebSocket.
//!
//! The crate decodes the binary frame format, routes sub-messages to the
//! subscriptions they belong to, handles the `_heartbeat`,
//! `_resetsubscriptions` and `_disconnect` control messages, reconnects with
//! the last received message id, and renews the access token before it
//! expires.
//!
//! ## Quick Start
//!
//! ```no_run
//! use saxo_streaming::types::auth::AccessToken;
//! use saxo_streaming::types::subscription::SubscriptionSpec;
//! use saxo_streaming::ws::session::StreamingSessionBuilder;
//!
//! #[tokio::main]
//! async fn main() -> saxo_streaming::error::Result<()> {
//!     let (session, handle) = StreamingSessionBuilder::new(AccessToken::new("your-access-token"))
//!         .context_id("my-app")
//!         .build()?;
//!     tokio::spawn(session.run());
//!
//!     let spec = SubscriptionSpec::new(
//!         "/trade/v1/infoprices/subscriptions",
//!         serde_json::json!({ "Uic": 21, "AssetType": "FxSpot" }),
//!     );
//!     let mut prices = handle.subscribe("eurusd", spec).await?;
//!     while let Some(update) = prices.updates.recv().await {
//!         println!("{update:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The frame decoder and router are usable on their own, without a
//! connection:
//!
//! ```
//! use saxo_streaming::ws::frame::{FrameDecoder, encode_message};
//! use saxo_streaming::types::enums::PayloadFormat;
//!
//! let frame = encode_message(1, "_heartbeat", PayloadFormat::Json, b"{}").unwrap();
//! let decoded = FrameDecoder::new().decode(frame).unwrap();
//! assert!(decoded.messages[0].is_control());
//! ```

pub mod api;
pub mod client;
pub mod constants;
pub mod error;
pub mod types;
pub mod ws;

/// Re-export the REST client at crate root for convenience.
pub use client::RestClient;
/// Re-export the error type and Result alias.
pub use error::{Result, StreamingError};
