use serde::{Deserialize, Serialize};

/// A single record read from a partition log.
///
/// This is also the element shape of the dispatcher's sink wire body, so it
/// serializes with exactly these field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Offset within the partition. Dense and strictly increasing, starting
    /// at 1.
    pub offset: i64,
    /// Decoded payload.
    pub data: serde_json::Value,
    /// Insertion timestamp as recorded by the store
    /// (`YYYY-MM-DD HH:MM:SS` text).
    pub created: String,
}
