//! Streaming WebSocket.
//!
//! A streaming connection delivers binary frames, each holding one or more
//! sub-messages tagged with the reference id of the subscription they belong
//! to. Reference ids starting with `_` are control messages from the server.
//!
//! - [`frame`]: frame decoding (and encoding, for tests and mock servers)
//! - [`schema`]: Protobuf payload decoding by reference id
//! - [`router`]: delivery to subscribers, reset bookkeeping, last message ids
//! - [`lifecycle`]: connection state machine, reconnect backoff, resume id
//! - [`control`]: the REST calls the session issues
//! - [`config`]: session configuration
//! - [`session`]: the connection task tying these together

pub mod config;
pub mod control;
pub mod frame;
pub mod lifecycle;
pub mod router;
pub mod schema;
pub mod session;
