//! Payload codec.
//!
//! Payloads are stored as opaque MessagePack blobs. Any JSON-like value
//! (scalars, strings, arrays, maps) round-trips losslessly. Every producer
//! and consumer sharing a store must use this codec end to end; the store
//! itself only ever sees bytes.

use bytes::Bytes;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("payload decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a payload into its stored form.
pub fn encode(payload: &serde_json::Value) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec(payload)?))
}

/// Decode a stored blob back into the payload it was produced with.
pub fn decode(data: &[u8]) -> Result<serde_json::Value> {
    Ok(rmp_serde::from_slice(data)?)
}
