//! Framed codec for the supervisor channel.
//!
//! One frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. LengthDelimitedCodec owns the prefix, serde_json the body.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame body. Larger frames are a protocol error.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const LARGE_FRAME_BYTES: usize = 100_000;

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bare framing: yields raw frame bodies without parsing them.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_SIZE)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: frame_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(body_bytes = body.len(), "Encoding frame");
        if body.len() > LARGE_FRAME_BYTES {
            tracing::info!(body_kb = body.len() / 1024, "Large frame being encoded");
        }
        // Prefix and body land in `dst` together; the writer flushes them as one unit.
        self.inner.encode(Bytes::from(body), dst)
    }
}
