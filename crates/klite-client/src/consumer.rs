//! Group-scoped consumer.
//!
//! A consumer is bound to one consumer group and tracks commit points per
//! (group, topic, partition) in the shared offsets table. Independent
//! groups never interfere: each has its own row, so one group's commit
//! does not move another group's cursor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use klite_core::{codec, Message};
use klite_store::{partition_table, SqlValue, Statement, Store, StoreError, OFFSETS_TABLE};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Consumer configuration. The group is fixed for the lifetime of the
/// instance.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
}

/// Options for [`Consumer::fetch`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_messages: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { max_messages: 100 }
    }
}

/// A committed offset row, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetRecord {
    pub topic: String,
    pub partition: u32,
    pub commit_offset: i64,
    pub updated_at: String,
}

/// Fetch/commit API scoped to one consumer group.
pub struct Consumer {
    store: Arc<dyn Store>,
    group: String,
    offsets_ready: AtomicBool,
    /// Keys known to already have an offset row, so commits can go
    /// straight to UPDATE instead of racing an INSERT.
    known_rows: Mutex<HashSet<(String, u32)>>,
}

impl Consumer {
    pub fn new(store: Arc<dyn Store>, config: ConsumerConfig) -> Self {
        Self {
            store,
            group: config.group,
            offsets_ready: AtomicBool::new(false),
            known_rows: Mutex::new(HashSet::new()),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create the shared offsets table on first use. Idempotent.
    async fn ensure_offsets_table(&self) -> Result<()> {
        if self.offsets_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        // "partition" is a keyword in modern SQLite; always quoted.
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {OFFSETS_TABLE} (\
             consumer_group VARCHAR NOT NULL, \
             topic VARCHAR NOT NULL, \
             \"partition\" INTEGER NOT NULL, \
             commit_offset INTEGER NOT NULL, \
             updated_at DATETIME DEFAULT CURRENT_TIMESTAMP, \
             PRIMARY KEY (consumer_group, topic, \"partition\"))"
        );
        self.store.execute(Statement::new(ddl)).await?;

        self.offsets_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Last committed offset for this group on `(topic, partition)`, or
    /// `-1` when the group has never committed there. Offsets start at 1,
    /// so `-1` reads as "fetch from the beginning".
    pub async fn last_offset(&self, topic: &str, partition: u32) -> Result<i64> {
        self.ensure_offsets_table().await?;

        let stmt = Statement::new(format!(
            "SELECT commit_offset FROM {OFFSETS_TABLE} \
             WHERE consumer_group = ? AND topic = ? AND \"partition\" = ?"
        ))
        .bind(self.group.as_str())
        .bind(topic)
        .bind(partition);

        let result = self.store.execute(stmt).await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(SqlValue::as_i64)
            .unwrap_or(-1))
    }

    /// Fetch up to `max_messages` uncommitted messages in ascending offset
    /// order, payloads decoded.
    ///
    /// A partition nobody has produced to yet has no table; that case
    /// returns an empty batch rather than an error. The flip side is that
    /// a mistyped topic name also reads as an empty stream.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        options: FetchOptions,
    ) -> Result<Vec<Message>> {
        let last = self.last_offset(topic, partition).await?;
        let table = partition_table(topic, partition)?;

        let stmt = Statement::new(format!(
            "SELECT id, data, created FROM {table} WHERE id > ? ORDER BY id ASC LIMIT ?"
        ))
        .bind(last)
        .bind(options.max_messages as i64);

        let result = match self.store.execute(stmt).await {
            Ok(result) => result,
            Err(StoreError::NoSuchTable(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let (Some(offset), Some(data), Some(created)) = (
                row.get(0).and_then(SqlValue::as_i64),
                row.get(1).and_then(SqlValue::as_blob),
                row.get(2).and_then(SqlValue::as_str),
            ) else {
                return Err(ClientError::MalformedRow {
                    table: table.clone(),
                });
            };
            messages.push(Message {
                offset,
                data: codec::decode(data)?,
                created: created.to_string(),
            });
        }
        Ok(messages)
    }

    /// Record that every message up to and including `offset` has been
    /// processed by this group.
    ///
    /// The first commit for a key races other instances of the same group:
    /// INSERT first, fall back to UPDATE when another instance won the
    /// insert. Commits never move the stored offset backwards — the update
    /// clamps with `MAX(commit_offset, ?)`.
    pub async fn commit(&self, topic: &str, partition: u32, offset: i64) -> Result<()> {
        self.ensure_offsets_table().await?;

        let key = (topic.to_string(), partition);
        let known = self.known_rows.lock().await.contains(&key);

        if known {
            self.update_offset(topic, partition, offset).await?;
        } else {
            let insert = Statement::new(format!(
                "INSERT INTO {OFFSETS_TABLE} (consumer_group, topic, \"partition\", commit_offset) \
                 VALUES (?, ?, ?, ?)"
            ))
            .bind(self.group.as_str())
            .bind(topic)
            .bind(partition)
            .bind(offset);

            match self.store.execute(insert).await {
                Ok(_) => {}
                Err(StoreError::UniqueViolation(_)) => {
                    self.update_offset(topic, partition, offset).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.known_rows.lock().await.insert(key);
        debug!(group = %self.group, topic, partition, offset, "committed offset");
        Ok(())
    }

    async fn update_offset(&self, topic: &str, partition: u32, offset: i64) -> Result<()> {
        let stmt = Statement::new(format!(
            "UPDATE {OFFSETS_TABLE} \
             SET commit_offset = MAX(commit_offset, ?), updated_at = CURRENT_TIMESTAMP \
             WHERE consumer_group = ? AND topic = ? AND \"partition\" = ?"
        ))
        .bind(offset)
        .bind(self.group.as_str())
        .bind(topic)
        .bind(partition);

        self.store.execute(stmt).await?;
        Ok(())
    }

    /// Every offset row recorded for this group, ordered by topic and
    /// partition.
    pub async fn list_offsets(&self) -> Result<Vec<OffsetRecord>> {
        self.ensure_offsets_table().await?;

        let stmt = Statement::new(format!(
            "SELECT topic, \"partition\", commit_offset, updated_at FROM {OFFSETS_TABLE} \
             WHERE consumer_group = ? ORDER BY topic, \"partition\""
        ))
        .bind(self.group.as_str());

        let result = self.store.execute(stmt).await?;
        let mut records = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let (Some(topic), Some(partition), Some(commit_offset), Some(updated_at)) = (
                row.get(0).and_then(SqlValue::as_str),
                row.get(1)
                    .and_then(SqlValue::as_i64)
                    .and_then(|v| u32::try_from(v).ok()),
                row.get(2).and_then(SqlValue::as_i64),
                row.get(3).and_then(SqlValue::as_str),
            ) else {
                return Err(ClientError::MalformedRow {
                    table: OFFSETS_TABLE.to_string(),
                });
            };
            records.push(OffsetRecord {
                topic: topic.to_string(),
                partition,
                commit_offset,
                updated_at: updated_at.to_string(),
            });
        }
        Ok(records)
    }
}
