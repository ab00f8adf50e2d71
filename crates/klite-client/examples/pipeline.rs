//! Produce a few records into a fresh in-memory store and read them back.
//!
//! Run with: cargo run -p klite-client --example pipeline

use std::sync::Arc;

use klite_client::{Consumer, ConsumerConfig, FetchOptions, Producer};
use klite_store::{SqliteStore, Store};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().await?);

    let producer = Producer::new(Arc::clone(&store));
    for i in 0..3 {
        let result = producer.send("orders", 0, &json!({"order": i})).await?;
        println!("wrote order {i} at offset {}", result.wait_offset().await?);
    }
    producer.close().await?;

    let consumer = Consumer::new(
        store,
        ConsumerConfig {
            group: "demo".to_string(),
        },
    );
    for message in consumer.fetch("orders", 0, FetchOptions::default()).await? {
        println!("read offset {} -> {}", message.offset, message.data);
    }

    Ok(())
}
