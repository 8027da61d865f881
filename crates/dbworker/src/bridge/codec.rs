//! Framed codec for parent-worker communication.
//!
//! Uses LengthDelimitedCodec for framing (4-byte big-endian length prefix) and
//! a pluggable [`PayloadCodec`] for the value list inside each frame.
//! Works over any byte buffer, so the blocking executor and the non-blocking
//! parent share it.

use std::io;

use serde_json::Value;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Width of the frame length prefix in bytes.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Serializes the ordered value list carried by one frame.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode(&self, values: &[Value]) -> io::Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> io::Result<Vec<Value>>;
}

/// JSON array payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayload;

impl PayloadCodec for JsonPayload {
    fn encode(&self, values: &[Value]) -> io::Result<Vec<u8>> {
        serde_json::to_vec(values).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn decode(&self, bytes: &[u8]) -> io::Result<Vec<Value>> {
        serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Codec that frames value lists with a length prefix.
///
/// `decode` returns `Ok(None)` until a whole frame is buffered, so callers can
/// feed it arbitrarily chunked reads and loop until `None` to drain every
/// complete frame.
pub struct FrameCodec<P = JsonPayload> {
    inner: LengthDelimitedCodec,
    payload: P,
}

impl Default for FrameCodec<JsonPayload> {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec<JsonPayload> {
    pub fn new() -> Self {
        Self::with_payload(JsonPayload)
    }
}

impl<P: PayloadCodec> FrameCodec<P> {
    pub fn with_payload(payload: P) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_LEN)
                .max_frame_length(u32::MAX as usize)
                .big_endian()
                .new_codec(),
            payload,
        }
    }
}

impl<P: PayloadCodec> Decoder for FrameCodec<P> {
    type Item = Vec<Value>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                tracing::trace!(frame_size_bytes = bytes.len(), "Decoded frame");
                self.payload.decode(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl<P: PayloadCodec> Encoder<&[Value]> for FrameCodec<P> {
    type Error = io::Error;

    fn encode(&mut self, item: &[Value], dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self.payload.encode(item)?;
        let payload_len = payload.len();
        tracing::trace!(frame_size_bytes = payload_len, "Encoding frame");
        if payload_len > 1_000_000 {
            tracing::debug!(
                frame_size_bytes = payload_len,
                frame_size_kb = payload_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(payload), dst)
    }
}
