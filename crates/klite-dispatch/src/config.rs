//! Dispatcher configuration.
//!
//! The configuration tree maps topics to consumer groups to delivery
//! specs. Keys are camelCase on the wire and unknown keys are rejected, so
//! a typo fails at startup instead of silently configuring nothing.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DispatchError, Result};

/// Root of the dispatcher configuration tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub topics: HashMap<String, TopicSpec>,
}

impl WorkerConfig {
    /// Parse a JSON configuration tree. A missing `topics` key or any
    /// unrecognized key is a configuration error.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| DispatchError::Config(e.to_string()))
    }
}

/// Per-topic configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TopicSpec {
    /// Consumer groups pumping this topic. A topic configured without any
    /// groups is skipped with a warning at startup.
    #[serde(default)]
    pub consumer_groups: HashMap<String, GroupSpec>,
}

/// Delivery spec for one (topic, consumer group) assignment.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GroupSpec {
    /// Partitions this group drains; all are processed concurrently each
    /// cycle.
    pub partitions: Vec<u32>,
    /// Sink URL receiving the batches.
    pub endpoint: String,
    /// Maximum messages fetched and shipped per partition per cycle.
    pub batch_size: usize,
    /// Cycle interval, e.g. `500ms`, `5s`, `1m`.
    pub interval: String,
}

/// Parse an interval of the form `<digits><unit>` with unit `ms`, `s` or
/// `m`. Anything else is a configuration error.
pub fn parse_interval(spec: &str) -> Result<Duration> {
    let digits_end = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    let (digits, unit) = spec.split_at(digits_end);

    if digits.is_empty() {
        return Err(DispatchError::InvalidInterval(spec.to_string()));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| DispatchError::InvalidInterval(spec.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| DispatchError::InvalidInterval(spec.to_string())),
        _ => Err(DispatchError::InvalidInterval(spec.to_string())),
    }
}
