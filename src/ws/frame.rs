//! Binary streaming frame decoder.
//!
//! One WebSocket binary message (a *frame*) carries zero or more
//! sub-messages back to back. Every sub-message has the layout below, all
//! integers little-endian:
//!
//! | Field | Size | Notes |
//! |---|---|---|
//! | message id | 8 | unsigned, resumption token |
//! | reserved | 2 | ignored |
//! | reference id length N | 1 | unsigned |
//! | reference id | N | ASCII |
//! | payload format | 1 | 0 = JSON, 1 = Protobuf |
//! | payload length M | 4 | unsigned |
//! | payload | M | |
//!
//! A layout that runs past the end of the frame is a
//! [`Framing`](StreamingError::Framing) error and aborts the frame. A payload
//! that fails to decode only drops its own sub-message.
//!
//! # Example
//!
//! ```
//! use saxo_streaming::ws::frame::{FrameDecoder, FrameEncoder};
//! use saxo_streaming::types::enums::PayloadFormat;
//!
//! # fn main() -> saxo_streaming::Result<()> {
//! let frame = FrameEncoder::new()
//!     .message(1, "prices", PayloadFormat::Json, br#"{"Quote":{"Bid":1.1}}"#)?
//!     .message(2, "_heartbeat", PayloadFormat::Json, b"{}")?
//!     .finish();
//!
//! let decoded = FrameDecoder::new().decode(frame)?;
//! assert_eq!(decoded.messages.len(), 2);
//! assert_eq!(decoded.last_message_id, Some(2));
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::constants::wire::{PAYLOAD_FORMAT_LEN, PAYLOAD_LEN_LEN, PREFIX_LEN, RESERVED_LEN};
use crate::constants::{CONTROL_PREFIX, limits::MAX_ID_LEN};
use crate::error::{Result, StreamingError};
use crate::types::enums::PayloadFormat;
use crate::ws::schema::SchemaRegistry;

// ---------------------------------------------------------------------------
// Decoded types
// ---------------------------------------------------------------------------

/// One sub-message of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Resumption token. Compared for equality only; never treated as a
    /// dense sequence number.
    pub message_id: u64,
    /// Subscription or control-channel reference id.
    pub reference_id: String,
    /// Encoding the payload arrived in.
    pub payload_format: PayloadFormat,
    /// Parsed JSON, or the JSON rendering of a decoded Protobuf message.
    pub payload: Value,
    /// The undecoded payload bytes (a zero-copy slice of the frame).
    pub raw: Bytes,
}

impl DecodedMessage {
    /// Whether this sub-message belongs to a control channel.
    pub fn is_control(&self) -> bool {
        self.reference_id.starts_with(CONTROL_PREFIX)
    }
}

/// Result of decoding one frame.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    /// Successfully decoded sub-messages, in wire order.
    pub messages: Vec<DecodedMessage>,
    /// Per-sub-message failures that were skipped
    /// ([`PayloadDecode`](StreamingError::PayloadDecode) /
    /// [`UnsupportedFormat`](StreamingError::UnsupportedFormat)).
    pub errors: Vec<StreamingError>,
    /// Message id of the last sub-message in wire order, skipped ones
    /// included.
    pub last_message_id: Option<u64>,
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Bounds-checked reader over one frame.
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn is_exhausted(&self) -> bool {
        self.offset == self.data.len()
    }

    /// Take `n` bytes, or fail without moving the cursor.
    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(StreamingError::Framing {
                field,
                offset: self.offset,
                needed: n,
                available: self.remaining(),
            });
        }
        let start = self.offset;
        self.offset += n;
        Ok(&self.data[start..self.offset])
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(field, 1)?[0])
    }

    fn read_u32_le(&mut self, field: &'static str) -> Result<u32> {
        let b = self.take(field, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64_le(&mut self, field: &'static str) -> Result<u64> {
        let b = self.take(field, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decodes binary frames into [`DecodedMessage`]s.
///
/// Stateless apart from the optional schema registry used for Protobuf
/// payloads; `decode` may be called with any frame in any order.
#[derive(Clone, Default)]
pub struct FrameDecoder {
    schemas: Option<Arc<dyn SchemaRegistry>>,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("schemas", &self.schemas.is_some())
            .finish()
    }
}

/// Fields of one sub-message before its payload is interpreted.
struct RawSubMessage {
    message_id: u64,
    reference_id: std::result::Result<String, String>,
    format: u8,
    payload: Bytes,
}

impl FrameDecoder {
    /// A decoder that handles JSON payloads only.
    pub fn new() -> Self {
        Self { schemas: None }
    }

    /// A decoder that also decodes Protobuf payloads through `schemas`.
    pub fn with_schemas(schemas: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            schemas: Some(schemas),
        }
    }

    /// Decode one frame.
    ///
    /// Returns [`StreamingError::Framing`] if any declared length runs past
    /// the end of `frame`; no partial result is returned in that case.
    pub fn decode(&self, frame: Bytes) -> Result<DecodedFrame> {
        let mut cursor = Cursor::new(&frame);
        let mut raw_messages = Vec::new();

        while !cursor.is_exhausted() {
            raw_messages.push(Self::read_sub_message(&mut cursor, &frame)?);
        }

        let mut out = DecodedFrame {
            messages: Vec::with_capacity(raw_messages.len()),
            errors: Vec::new(),
            last_message_id: raw_messages.last().map(|m| m.message_id),
        };

        for raw in raw_messages {
            match self.decode_payload(raw) {
                Ok(msg) => out.messages.push(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable sub-message");
                    out.errors.push(e);
                }
            }
        }

        tracing::trace!(
            messages = out.messages.len(),
            skipped = out.errors.len(),
            bytes = frame.len(),
            "Decoded frame"
        );
        Ok(out)
    }

    /// Consume one sub-message's layout, validating every length against the
    /// frame bounds.
    fn read_sub_message(cursor: &mut Cursor<'_>, frame: &Bytes) -> Result<RawSubMessage> {
        let message_id = cursor.read_u64_le("message id")?;
        cursor.take("reserved", RESERVED_LEN)?;
        let ref_len = cursor.read_u8("reference id length")? as usize;
        let ref_bytes = cursor.take("reference id", ref_len)?;
        let reference_id = match std::str::from_utf8(ref_bytes) {
            Ok(s) if s.is_ascii() => Ok(s.to_owned()),
            _ => Err(String::from_utf8_lossy(ref_bytes).into_owned()),
        };
        let format = cursor.read_u8("payload format")?;
        let payload_len = cursor.read_u32_le("payload length")? as usize;
        let start = cursor.offset;
        cursor.take("payload", payload_len)?;

        Ok(RawSubMessage {
            message_id,
            reference_id,
            format,
            payload: frame.slice(start..start + payload_len),
        })
    }

    fn decode_payload(&self, raw: RawSubMessage) -> Result<DecodedMessage> {
        let message_id = raw.message_id;
        let reference_id = raw.reference_id.map_err(|lossy| StreamingError::PayloadDecode {
            message_id,
            reference_id: lossy,
            reason: "reference id is not ASCII".into(),
        })?;

        let Some(payload_format) = PayloadFormat::from_byte(raw.format) else {
            return Err(StreamingError::UnsupportedFormat {
                message_id,
                reference_id,
                format: raw.format,
            });
        };

        let payload = match payload_format {
            // Control messages such as `_disconnect` may carry no body.
            PayloadFormat::Json if raw.payload.is_empty() => Value::Null,
            PayloadFormat::Json => serde_json::from_slice::<Value>(&raw.payload).map_err(|e| {
                StreamingError::PayloadDecode {
                    message_id,
                    reference_id: reference_id.clone(),
                    reason: e.to_string(),
                }
            })?,
            PayloadFormat::Protobuf => {
                let decoded = self
                    .schemas
                    .as_ref()
                    .and_then(|s| s.decode(&reference_id, &raw.payload));
                match decoded {
                    Some(Ok(value)) => value,
                    Some(Err(reason)) => {
                        return Err(StreamingError::PayloadDecode {
                            message_id,
                            reference_id,
                            reason,
                        });
                    }
                    None => {
                        return Err(StreamingError::UnsupportedFormat {
                            message_id,
                            reference_id,
                            format: raw.format,
                        });
                    }
                }
            }
        };

        Ok(DecodedMessage {
            message_id,
            reference_id,
            payload_format,
            payload,
            raw: raw.payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Builds frames in the streaming wire format.
///
/// The server is the only producer of frames in production; the encoder
/// exists for tests, replay tools, and mock servers.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    buf: BytesMut,
}

impl FrameEncoder {
    /// An empty frame.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Append one sub-message.
    pub fn message(
        mut self,
        message_id: u64,
        reference_id: &str,
        format: PayloadFormat,
        payload: &[u8],
    ) -> Result<Self> {
        self.push_raw(message_id, reference_id, format as u8, payload)?;
        Ok(self)
    }

    /// Append one sub-message with an arbitrary format byte.
    pub fn push_raw(
        &mut self,
        message_id: u64,
        reference_id: &str,
        format: u8,
        payload: &[u8],
    ) -> Result<()> {
        if !reference_id.is_ascii() || reference_id.len() > MAX_ID_LEN {
            return Err(StreamingError::InvalidArgument(format!(
                "reference id {reference_id:?} must be ASCII and at most {MAX_ID_LEN} bytes"
            )));
        }
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            StreamingError::InvalidArgument("payload larger than 4 GiB".into())
        })?;

        self.buf.reserve(
            PREFIX_LEN
                + reference_id.len()
                + PAYLOAD_FORMAT_LEN
                + PAYLOAD_LEN_LEN
                + payload.len(),
        );
        self.buf.put_u64_le(message_id);
        self.buf.put_u16_le(0);
        self.buf.put_u8(reference_id.len() as u8);
        self.buf.put_slice(reference_id.as_bytes());
        self.buf.put_u8(format);
        self.buf.put_u32_le(payload_len);
        self.buf.put_slice(payload);
        Ok(())
    }

    /// The finished frame.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Encode a single-sub-message frame.
pub fn encode_message(
    message_id: u64,
    reference_id: &str,
    format: PayloadFormat,
    payload: &[u8],
) -> Result<Bytes> {
    Ok(FrameEncoder::new()
        .message(message_id, reference_id, format, payload)?
        .finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_frame(entries: &[(u64, &str, Value)]) -> Bytes {
        let mut enc = FrameEncoder::new();
        for (id, reference_id, payload) in entries {
            let body = serde_json::to_vec(payload).unwrap();
            enc.push_raw(*id, reference_id, 0, &body).unwrap();
        }
        enc.finish()
    }

    #[test]
    fn decodes_multiple_sub_messages_in_order() {
        let frame = json_frame(&[
            (5, "A", json!({"v": 1})),
            (6, "B", json!({"v": 2})),
            (4, "C", json!([1, 2, 3])),
        ]);
        let decoded = FrameDecoder::new().decode(frame).unwrap();

        let ids: Vec<_> = decoded.messages.iter().map(|m| m.message_id).collect();
        let refs: Vec<_> = decoded.messages.iter().map(|m| m.reference_id.as_str()).collect();
        assert_eq!(ids, vec![5, 6, 4]);
        assert_eq!(refs, vec!["A", "B", "C"]);
        assert_eq!(decoded.messages[2].payload, json!([1, 2, 3]));
        assert_eq!(decoded.last_message_id, Some(4));
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn heartbeat_frame_layout() {
        // 8-byte id, 2 reserved, len=10, "_heartbeat", format 0, len=2, "{}"
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u64.to_le_bytes());
        raw.extend_from_slice(&[0, 0]);
        raw.push(10);
        raw.extend_from_slice(b"_heartbeat");
        raw.push(0);
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(b"{}");

        let decoded = FrameDecoder::new().decode(Bytes::from(raw)).unwrap();
        assert_eq!(decoded.messages.len(), 1);
        let msg = &decoded.messages[0];
        assert_eq!(msg.message_id, 1);
        assert_eq!(msg.reference_id, "_heartbeat");
        assert_eq!(msg.payload_format, PayloadFormat::Json);
        assert_eq!(msg.payload, json!({}));
        assert!(msg.is_control());
    }

    #[test]
    fn message_id_keeps_full_64_bit_precision() {
        let id = u64::MAX - 1;
        let frame = encode_message(id, "p", PayloadFormat::Json, b"1").unwrap();
        let decoded = FrameDecoder::new().decode(frame).unwrap();
        assert_eq!(decoded.messages[0].message_id, id);

        let above_f64_precision = (1u64 << 53) + 1;
        let frame = encode_message(above_f64_precision, "p", PayloadFormat::Json, b"1").unwrap();
        let decoded = FrameDecoder::new().decode(frame).unwrap();
        assert_eq!(decoded.messages[0].message_id, above_f64_precision);
    }

    #[test]
    fn empty_frame_yields_nothing() {
        let decoded = FrameDecoder::new().decode(Bytes::new()).unwrap();
        assert!(decoded.messages.is_empty());
        assert_eq!(decoded.last_message_id, None);
    }

    #[test]
    fn truncation_anywhere_is_a_framing_error() {
        let first_len = json_frame(&[(1, "prices", json!({"Bid": 1.5}))]).len();
        let frame = json_frame(&[(1, "prices", json!({"Bid": 1.5})), (2, "other", json!({}))]);
        for cut in 1..frame.len() {
            let truncated = frame.slice(..cut);
            // Cutting exactly at the sub-message boundary leaves a valid frame.
            if cut == first_len {
                assert_eq!(FrameDecoder::new().decode(truncated).unwrap().messages.len(), 1);
                continue;
            }
            let err = FrameDecoder::new().decode(truncated).unwrap_err();
            assert!(
                matches!(err, StreamingError::Framing { .. }),
                "cut at {cut}: {err:?}"
            );
        }
    }

    #[test]
    fn sub_message_length_is_prefix_reference_and_payload() {
        let frame = encode_message(1, "prices", PayloadFormat::Json, b"{}").unwrap();
        assert_eq!(
            frame.len(),
            PREFIX_LEN + "prices".len() + PAYLOAD_FORMAT_LEN + PAYLOAD_LEN_LEN + 2
        );
    }

    #[test]
    fn framing_error_reports_field_and_offset() {
        let mut raw = encode_message(9, "prices", PayloadFormat::Json, b"{}").unwrap().to_vec();
        // Declare a 100-byte payload that is not there.
        let len_at = PREFIX_LEN + "prices".len() + PAYLOAD_FORMAT_LEN;
        raw[len_at..len_at + 4].copy_from_slice(&100u32.to_le_bytes());

        match FrameDecoder::new().decode(Bytes::from(raw)).unwrap_err() {
            StreamingError::Framing {
                field,
                offset,
                needed,
                available,
            } => {
                assert_eq!(field, "payload");
                assert_eq!(offset, len_at + 4);
                assert_eq!(needed, 100);
                assert_eq!(available, 2);
            }
            other => panic!("expected framing error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_only_drops_its_sub_message() {
        let mut enc = FrameEncoder::new();
        enc.push_raw(1, "a", 0, br#"{"ok":true}"#).unwrap();
        enc.push_raw(2, "b", 0, b"{not json").unwrap();
        enc.push_raw(3, "c", 0, br#"{"ok":true}"#).unwrap();

        let decoded = FrameDecoder::new().decode(enc.finish()).unwrap();
        let refs: Vec<_> = decoded.messages.iter().map(|m| m.reference_id.as_str()).collect();
        assert_eq!(refs, vec!["a", "c"]);
        assert_eq!(decoded.errors.len(), 1);
        assert!(matches!(
            &decoded.errors[0],
            StreamingError::PayloadDecode { message_id: 2, reference_id, .. } if reference_id == "b"
        ));
        assert_eq!(decoded.last_message_id, Some(3));
    }

    #[test]
    fn unknown_format_and_unregistered_protobuf_are_unsupported() {
        let mut enc = FrameEncoder::new();
        enc.push_raw(1, "weird", 7, b"xx").unwrap();
        enc.push_raw(2, "proto", 1, &[0x08, 0x01]).unwrap();
        enc.push_raw(3, "fine", 0, b"null").unwrap();

        let decoded = FrameDecoder::new().decode(enc.finish()).unwrap();
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.messages[0].payload, Value::Null);
        assert!(matches!(
            decoded.errors[0],
            StreamingError::UnsupportedFormat { format: 7, .. }
        ));
        assert!(matches!(
            decoded.errors[1],
            StreamingError::UnsupportedFormat { format: 1, .. }
        ));
    }

    #[test]
    fn non_ascii_reference_id_is_skipped() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u64.to_le_bytes());
        raw.extend_from_slice(&[0, 0]);
        raw.push(2);
        raw.extend_from_slice(&[0xC3, 0xA9]); // "é"
        raw.push(0);
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(b"{}");

        let decoded = FrameDecoder::new().decode(Bytes::from(raw)).unwrap();
        assert!(decoded.messages.is_empty());
        assert!(matches!(decoded.errors[0], StreamingError::PayloadDecode { .. }));
    }

    #[test]
    fn raw_payload_is_a_slice_of_the_frame() {
        let frame = encode_message(1, "p", PayloadFormat::Json, br#"{"x":1}"#).unwrap();
        let decoded = FrameDecoder::new().decode(frame).unwrap();
        assert_eq!(&decoded.messages[0].raw[..], br#"{"x":1}"#);
    }

    #[test]
    fn empty_json_payload_is_null() {
        let frame = encode_message(3, "_disconnect", PayloadFormat::Json, b"").unwrap();
        let decoded = FrameDecoder::new().decode(frame).unwrap();
        assert_eq!(decoded.messages[0].payload, Value::Null);
    }

    #[test]
    fn encoder_rejects_oversized_reference_id() {
        let long = "r".repeat(MAX_ID_LEN + 1);
        assert!(encode_message(1, &long, PayloadFormat::Json, b"{}").is_err());
    }
}
