use std::sync::Arc;

use klite_core::CodecError;
use klite_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The batch insert carrying this send failed. Every waiter in the
    /// batch observes the same underlying store error.
    #[error("batch insert failed: {0}")]
    BatchFailed(Arc<StoreError>),

    /// The pending batch was dropped before it could be flushed.
    #[error("pending batch dropped before flush")]
    BatchLost,

    /// A partition row came back with an unexpected shape. A corrupt log
    /// row is fatal for that partition.
    #[error("malformed row in {table}")]
    MalformedRow { table: String },
}
