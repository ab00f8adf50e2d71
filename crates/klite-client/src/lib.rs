//! Producer and consumer APIs for klite partition logs.
//!
//! The producer coalesces concurrent sends into transactional
//! multi-inserts while preserving per-call offset results; the consumer
//! fetches uncommitted ranges and tracks commit points per consumer group.
//! Both talk to the store only through the [`klite_store::Store`] trait.

mod consumer;
mod error;
mod producer;

pub use consumer::{Consumer, ConsumerConfig, FetchOptions, OffsetRecord};
pub use error::{ClientError, Result};
pub use producer::{BatchResult, Producer, ProducerConfig, SendResult};
