//! REST endpoint implementations.
//!
//! Each sub-module adds `async` methods to
//! [`RestClient`](crate::client::RestClient) via `impl` blocks.
//!
//! | Module | Endpoints | Description |
//! |---|---|---|
//! | [`subscriptions`] | 3 | Create and remove streaming subscriptions on any service |
//! | [`streaming`] | 1 | Re-authorize an open streaming connection |

pub mod streaming;
pub mod subscriptions;
