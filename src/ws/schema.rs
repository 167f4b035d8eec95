//! Schema registry for Protobuf payloads.
//!
//! The decoder never compiles schemas itself. Callers register a `prost`
//! message type per reference id, and Protobuf payloads for that id are
//! decoded into it and rendered as JSON so that routing and consumers see one
//! payload type regardless of wire format.
//!
//! ```
//! use std::sync::Arc;
//! use saxo_streaming::ws::frame::FrameDecoder;
//! use saxo_streaming::ws::schema::ProstSchemaRegistry;
//!
//! #[derive(Clone, PartialEq, prost::Message, serde::Serialize)]
//! struct Tick {
//!     #[prost(double, tag = "1")]
//!     bid: f64,
//! }
//!
//! let mut registry = ProstSchemaRegistry::new();
//! registry.register::<Tick>("ticks");
//! let decoder = FrameDecoder::with_schemas(Arc::new(registry));
//! ```

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// Decodes Protobuf payloads by reference id.
pub trait SchemaRegistry: Send + Sync {
    /// Decode `payload` for `reference_id`.
    ///
    /// Returns `None` when no schema is registered for `reference_id`, and
    /// `Some(Err(reason))` when one is but the bytes do not decode.
    fn decode(&self, reference_id: &str, payload: &[u8]) -> Option<Result<Value, String>>;
}

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Value, String> + Send + Sync>;

/// [`SchemaRegistry`] backed by `prost` message types.
#[derive(Default)]
pub struct ProstSchemaRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl ProstSchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode Protobuf payloads for `reference_id` as `M`.
    pub fn register<M>(&mut self, reference_id: impl Into<String>) -> &mut Self
    where
        M: prost::Message + Default + Serialize + 'static,
    {
        self.register_fn(reference_id, |bytes| {
            let msg = M::decode(bytes).map_err(|e| e.to_string())?;
            serde_json::to_value(&msg).map_err(|e| e.to_string())
        })
    }

    /// Decode Protobuf payloads for `reference_id` with a custom function.
    pub fn register_fn<F>(&mut self, reference_id: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&[u8]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.decoders.insert(reference_id.into(), Box::new(f));
        self
    }

    /// Forget the schema for `reference_id`.
    pub fn unregister(&mut self, reference_id: &str) -> bool {
        self.decoders.remove(reference_id).is_some()
    }

    /// Whether a schema is registered for `reference_id`.
    pub fn contains(&self, reference_id: &str) -> bool {
        self.decoders.contains_key(reference_id)
    }
}

impl SchemaRegistry for ProstSchemaRegistry {
    fn decode(&self, reference_id: &str, payload: &[u8]) -> Option<Result<Value, String>> {
        self.decoders.get(reference_id).map(|f| f(payload))
    }
}

impl std::fmt::Debug for ProstSchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProstSchemaRegistry")
            .field("reference_ids", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
