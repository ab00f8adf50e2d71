//! The dispatcher worker.
//!
//! One pump per (topic, consumer group): each cycle it drains every
//! configured partition concurrently, POSTs the batches to the group's
//! sink, and commits offsets only for batches the sink acknowledged with a
//! 2xx. Everything non-fatal — sink rejections, transport failures, store
//! hiccups — is logged and retried at the next interval, which is what
//! makes delivery at-least-once end to end.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use klite_client::{Consumer, ConsumerConfig, FetchOptions};
use klite_core::Message;
use klite_store::Store;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{parse_interval, GroupSpec, WorkerConfig};
use crate::error::{DispatchError, Result};
use crate::shutdown::ShutdownHandle;

/// Wire body POSTed to a sink endpoint.
#[derive(Debug, Serialize)]
struct SinkBatch<'a> {
    topic: &'a str,
    partition: u32,
    messages: &'a [Message],
}

/// One validated (topic, group) assignment.
struct PumpSpec {
    topic: String,
    group: String,
    partitions: Vec<u32>,
    endpoint: reqwest::Url,
    batch_size: usize,
    interval: Duration,
}

impl PumpSpec {
    fn build(topic: String, group: String, spec: GroupSpec) -> Result<Self> {
        let interval = parse_interval(&spec.interval)?;
        let endpoint =
            reqwest::Url::parse(&spec.endpoint).map_err(|e| DispatchError::InvalidEndpoint {
                url: spec.endpoint.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            topic,
            group,
            partitions: spec.partitions,
            endpoint,
            batch_size: spec.batch_size,
            interval,
        })
    }

    async fn run(self, store: Arc<dyn Store>, client: reqwest::Client, mut shutdown: ShutdownHandle) {
        let consumer = Consumer::new(
            store,
            ConsumerConfig {
                group: self.group.clone(),
            },
        );
        info!(
            topic = %self.topic,
            group = %self.group,
            partitions = self.partitions.len(),
            "pump started"
        );

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let cycle = join_all(self.partitions.iter().map(|&partition| {
                process_partition(
                    &client,
                    &consumer,
                    &self.topic,
                    partition,
                    &self.endpoint,
                    self.batch_size,
                    self.interval,
                )
            }))
            .await;

            for (&partition, result) in self.partitions.iter().zip(cycle) {
                if let Err(e) = result {
                    error!(
                        topic = %self.topic,
                        group = %self.group,
                        partition,
                        error = %e,
                        "partition cycle failed"
                    );
                }
            }

            // Same pause after an error cycle as after a clean one.
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.wait() => break,
            }
        }

        info!(topic = %self.topic, group = %self.group, "pump stopped");
    }
}

/// Periodic pump of configured (topic, partition, group) assignments into
/// HTTP sinks.
pub struct DispatchWorker {
    store: Arc<dyn Store>,
    pumps: Vec<PumpSpec>,
    client: reqwest::Client,
    shutdown: ShutdownHandle,
}

impl DispatchWorker {
    /// Validate the configuration tree and build the worker.
    ///
    /// Interval and endpoint errors are fatal here, before anything runs.
    /// Topics configured without consumer groups are skipped with a
    /// warning.
    pub fn new(config: WorkerConfig, store: Arc<dyn Store>) -> Result<Self> {
        let mut pumps = Vec::new();
        for (topic, spec) in config.topics {
            if spec.consumer_groups.is_empty() {
                warn!(topic = %topic, "topic has no consumer groups, skipping");
                continue;
            }
            for (group, group_spec) in spec.consumer_groups {
                pumps.push(PumpSpec::build(topic.clone(), group, group_spec)?);
            }
        }

        Ok(Self {
            store,
            pumps,
            client: reqwest::Client::new(),
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Handle used to stop the worker from outside.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Launch every pump and run until shutdown is signalled. Resolves only
    /// once all pumps have exited.
    pub async fn run(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.pumps.len());
        for pump in self.pumps {
            let store = Arc::clone(&self.store);
            let client = self.client.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(pump.run(store, client, shutdown)));
        }

        info!(pumps = handles.len(), "dispatch worker started");

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "pump task panicked");
            }
        }
        Ok(())
    }
}

/// Fetch one batch for a partition, ship it, and commit on acknowledgment.
///
/// Sink rejections and transport failures are logged and leave the offset
/// untouched, so the same messages are redelivered next cycle. Store
/// errors propagate to the pump, which logs and continues.
async fn process_partition(
    client: &reqwest::Client,
    consumer: &Consumer,
    topic: &str,
    partition: u32,
    endpoint: &reqwest::Url,
    batch_size: usize,
    timeout: Duration,
) -> Result<()> {
    let messages = consumer
        .fetch(
            topic,
            partition,
            FetchOptions {
                max_messages: batch_size,
            },
        )
        .await?;
    let Some(last) = messages.last() else {
        return Ok(());
    };
    let last_offset = last.offset;

    let body = SinkBatch {
        topic,
        partition,
        messages: &messages,
    };
    let response = match client
        .post(endpoint.clone())
        .timeout(timeout)
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(
                topic,
                partition,
                group = %consumer.group(),
                error = %e,
                "sink request failed"
            );
            return Ok(());
        }
    };

    if response.status().is_success() {
        consumer.commit(topic, partition, last_offset).await?;
    } else {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        warn!(
            topic,
            partition,
            group = %consumer.group(),
            status = %status,
            body = %text,
            "sink rejected batch"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use klite_store::SqliteStore;
    use serde_json::json;

    async fn memory_store() -> Arc<dyn Store> {
        Arc::new(SqliteStore::open_in_memory().await.unwrap())
    }

    fn config(tree: serde_json::Value) -> WorkerConfig {
        WorkerConfig::from_json(tree).unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_bad_interval() {
        let config = config(json!({
            "topics": { "t": { "consumerGroups": { "g": {
                "partitions": [0],
                "endpoint": "http://localhost:9000",
                "batchSize": 10,
                "interval": "tenminutes"
            }}}}
        }));
        let result = DispatchWorker::new(config, memory_store().await);
        assert!(matches!(result, Err(DispatchError::InvalidInterval(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_bad_endpoint() {
        let config = config(json!({
            "topics": { "t": { "consumerGroups": { "g": {
                "partitions": [0],
                "endpoint": "not a url",
                "batchSize": 10,
                "interval": "1s"
            }}}}
        }));
        let result = DispatchWorker::new(config, memory_store().await);
        assert!(matches!(result, Err(DispatchError::InvalidEndpoint { .. })));
    }

    #[tokio::test]
    async fn test_topic_without_groups_starts_no_pump() {
        let config = config(json!({ "topics": { "quiet": {} } }));
        let worker = DispatchWorker::new(config, memory_store().await).unwrap();
        assert!(worker.pumps.is_empty());

        // With no pumps, run() resolves without a shutdown signal.
        worker.run().await.unwrap();
    }
}
