//! Dispatcher worker for klite.
//!
//! Takes a configuration tree of topics, consumer groups and sink
//! endpoints, and pumps uncommitted message batches to the sinks on a
//! fixed interval with at-least-once delivery: offsets are committed only
//! after a 2xx acknowledgment, so anything the sink did not acknowledge is
//! redelivered on a later cycle.

mod config;
mod error;
mod shutdown;
mod worker;

pub use config::{parse_interval, GroupSpec, TopicSpec, WorkerConfig};
pub use error::{DispatchError, Result};
pub use shutdown::ShutdownHandle;
pub use worker::DispatchWorker;
