//! Auto-batching producer.
//!
//! Concurrent `send` calls targeting the same (topic, partition) are
//! coalesced into one transactional multi-insert: each call buffers its
//! encoded payload together with a oneshot waiter, and a timer flushes the
//! batch `batch_delay` after the most recent send. Transaction commits
//! dominate insert cost, so coalescing buys throughput without giving up
//! the per-message offset in the result.
//!
//! Within one partition, call order equals waiter order equals insert order
//! equals offset order. Nothing is promised across partitions or across
//! producer instances beyond what the store's rowid allocation serializes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use klite_core::codec;
use klite_store::{partition_table, Statement, Store, StoreError};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{ClientError, Result};

/// Producer tuning knobs.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// How long a pending batch waits for more sends before it flushes.
    /// Zero flushes on the next scheduler tick.
    pub batch_delay: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(10),
        }
    }
}

type WaiterResult = std::result::Result<i64, Arc<StoreError>>;

/// Handle returned by [`Producer::send`]. The send is buffered when the
/// handle is returned; the offset materializes once the batch flushes.
pub struct SendResult {
    receiver: oneshot::Receiver<WaiterResult>,
}

impl SendResult {
    /// Wait until the batch carrying this payload has been written and
    /// return the offset it was assigned.
    pub async fn wait_offset(self) -> Result<i64> {
        match self.receiver.await {
            Ok(Ok(offset)) => Ok(offset),
            Ok(Err(e)) => Err(ClientError::BatchFailed(e)),
            Err(_) => Err(ClientError::BatchLost),
        }
    }
}

/// Result of an explicit [`Producer::send_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    /// Offset assigned to the first payload; the i-th payload received
    /// `first_offset + i`.
    pub first_offset: i64,
    pub count: usize,
}

struct PendingBatch {
    /// Generation id. A timer only flushes the batch it was armed for, so
    /// a stale timer firing after a flush never touches a rebuilt batch.
    id: u64,
    payloads: Vec<Bytes>,
    waiters: Vec<oneshot::Sender<WaiterResult>>,
    timer: Option<JoinHandle<()>>,
}

struct ProducerInner {
    store: Arc<dyn Store>,
    batch_delay: Duration,
    pending: Mutex<HashMap<(String, u32), PendingBatch>>,
    next_batch_id: AtomicU64,
}

impl ProducerInner {
    /// Detach the pending batch for `key` if it still carries `expected_id`
    /// and write it out. Called from timer tasks.
    async fn flush_expired(self: Arc<Self>, key: (String, u32), expected_id: u64) {
        let detached = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(batch) if batch.id == expected_id => pending.remove(&key),
                _ => None,
            }
        };
        if let Some(batch) = detached {
            Self::write_batch(&*self.store, &key.0, key.1, batch).await;
        }
    }

    /// Write a detached batch as one transaction and settle its waiters
    /// with `first_insert_rowid + index`, or all with the store error.
    ///
    /// The batch's own timer handle is dropped rather than aborted: this
    /// may be running on that very timer task, and a stale timer firing
    /// later finds no batch with its id and does nothing.
    async fn write_batch(store: &dyn Store, topic: &str, partition: u32, batch: PendingBatch) {
        // The topic was validated when the batch was first built.
        let Ok(table) = partition_table(topic, partition) else {
            return;
        };

        let count = batch.payloads.len();
        let stmts: Vec<Statement> = batch
            .payloads
            .into_iter()
            .map(|payload| {
                Statement::new(format!("INSERT INTO {table} (data) VALUES (?)")).bind(payload)
            })
            .collect();

        match store.batch(stmts).await {
            Ok(results) => {
                let first = results.first().map(|r| r.last_insert_rowid).unwrap_or_default();
                debug!(topic, partition, count, first_offset = first, "flushed batch");
                for (index, waiter) in batch.waiters.into_iter().enumerate() {
                    let _ = waiter.send(Ok(first + index as i64));
                }
            }
            Err(e) => {
                error!(topic, partition, count, error = %e, "batch insert failed");
                let shared = Arc::new(e);
                for waiter in batch.waiters {
                    let _ = waiter.send(Err(Arc::clone(&shared)));
                }
            }
        }
    }
}

/// Auto-batching writer for partition logs.
///
/// A producer owns its pending-batch state exclusively; share one instance
/// behind an `Arc` rather than creating one per call site. Dropping a
/// producer does not lose buffered sends — armed timers keep the internals
/// alive until their batches flush — but [`Producer::flush`] (or
/// [`Producer::close`]) is the way to drain deterministically on shutdown.
pub struct Producer {
    inner: Arc<ProducerInner>,
    ensured: Mutex<HashSet<(String, u32)>>,
}

impl Producer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, ProducerConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, config: ProducerConfig) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                store,
                batch_delay: config.batch_delay,
                pending: Mutex::new(HashMap::new()),
                next_batch_id: AtomicU64::new(0),
            }),
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Create the partition log table for `(topic, partition)` if this
    /// instance has not seen the pair yet. Idempotent, and safe under
    /// concurrent DDL from other producers.
    pub async fn ensure_table(&self, topic: &str, partition: u32) -> Result<()> {
        let key = (topic.to_string(), partition);
        if self.ensured.lock().await.contains(&key) {
            return Ok(());
        }

        let table = partition_table(topic, partition)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             data BLOB NOT NULL, \
             created DATETIME DEFAULT CURRENT_TIMESTAMP)"
        );
        self.inner.store.execute(Statement::new(ddl)).await?;

        self.ensured.lock().await.insert(key);
        debug!(topic, partition, "ensured partition table");
        Ok(())
    }

    /// Buffer one payload for `(topic, partition)` and return a handle that
    /// resolves to the offset the payload receives.
    ///
    /// The pending batch for the pair flushes `batch_delay` after the most
    /// recent send, so a burst of sends lands in a single transaction.
    pub async fn send(
        &self,
        topic: &str,
        partition: u32,
        payload: &serde_json::Value,
    ) -> Result<SendResult> {
        self.ensure_table(topic, partition).await?;
        let encoded = codec::encode(payload)?;
        let (sender, receiver) = oneshot::channel();

        let key = (topic.to_string(), partition);
        let mut pending = self.inner.pending.lock().await;
        let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
            id: self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed),
            payloads: Vec::new(),
            waiters: Vec::new(),
            timer: None,
        });
        batch.payloads.push(encoded);
        batch.waiters.push(sender);

        // Re-arm the timer so the batch flushes batch_delay after the most
        // recent send, not the first.
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        let inner = Arc::clone(&self.inner);
        let batch_id = batch.id;
        let delay = self.inner.batch_delay;
        batch.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_expired(key, batch_id).await;
        }));
        drop(pending);

        Ok(SendResult { receiver })
    }

    /// Write `payloads` immediately as one transaction, bypassing the
    /// pending window. An in-flight auto-batch for the same pair is left
    /// untouched and flushes on its own timer.
    pub async fn send_batch(
        &self,
        topic: &str,
        partition: u32,
        payloads: &[serde_json::Value],
    ) -> Result<BatchResult> {
        self.ensure_table(topic, partition).await?;
        if payloads.is_empty() {
            return Ok(BatchResult {
                first_offset: 0,
                count: 0,
            });
        }

        let table = partition_table(topic, partition)?;
        let mut stmts = Vec::with_capacity(payloads.len());
        for payload in payloads {
            stmts.push(
                Statement::new(format!("INSERT INTO {table} (data) VALUES (?)"))
                    .bind(codec::encode(payload)?),
            );
        }

        let results = self.inner.store.batch(stmts).await?;
        let first_offset = results.first().map(|r| r.last_insert_rowid).unwrap_or_default();
        debug!(topic, partition, count = payloads.len(), first_offset, "wrote explicit batch");

        Ok(BatchResult {
            first_offset,
            count: payloads.len(),
        })
    }

    /// Drain every pending batch. Returns once all buffered waiters have
    /// been settled. Intended for graceful shutdown.
    pub async fn flush(&self) -> Result<()> {
        let detached: Vec<((String, u32), PendingBatch)> = {
            let mut pending = self.inner.pending.lock().await;
            pending.drain().collect()
        };

        for ((topic, partition), mut batch) in detached {
            // Unlike the timer path, this never runs on a timer task, so
            // the armed timers can be cancelled outright.
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
            ProducerInner::write_batch(&*self.inner.store, &topic, partition, batch).await;
        }
        Ok(())
    }

    /// Flush and consume the producer.
    pub async fn close(self) -> Result<()> {
        self.flush().await
    }
}
