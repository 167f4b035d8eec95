//! Request, response and payload types.
//!
//! - [`enums`]: payload formats, heartbeat reasons, subscription states
//! - [`auth`]: access token and its expiry
//! - [`subscription`]: subscription specs, create request and response, id validation
//! - [`control`]: payloads of the `_heartbeat` and `_resetsubscriptions` control messages
//!
//! All enums are re-exported at the module root via `pub use enums::*`.

pub mod auth;
pub mod control;
pub mod enums;
pub mod subscription;

pub use enums::*;
