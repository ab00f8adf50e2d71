//! Dispatcher end-to-end tests against a local mock sink.
//!
//! The sink is an axum router on an ephemeral port that records every body
//! it receives and answers with a switchable status code.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use klite_client::{Consumer, ConsumerConfig, Producer};
use klite_dispatch::{DispatchWorker, WorkerConfig};
use klite_store::{SqlValue, SqliteStore, Statement, Store};
use serde_json::json;

#[derive(Clone)]
struct SinkState {
    bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    status: Arc<AtomicU16>,
}

async fn sink_handler(
    State(state): State<SinkState>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, String) {
    state.bodies.lock().unwrap().push(body);
    let status =
        StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK);
    let text = if status.is_success() {
        String::new()
    } else {
        "sink unavailable".to_string()
    };
    (status, text)
}

async fn start_sink(status: u16) -> (String, SinkState) {
    let state = SinkState {
        bodies: Arc::new(Mutex::new(Vec::new())),
        status: Arc::new(AtomicU16::new(status)),
    };
    let app = Router::new()
        .route("/sink", post(sink_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/sink"), state)
}

async fn memory_store() -> Arc<dyn Store> {
    Arc::new(SqliteStore::open_in_memory().await.unwrap())
}

fn worker_config(topic: &str, group: &str, endpoint: &str) -> WorkerConfig {
    WorkerConfig::from_json(json!({
        "topics": { topic: { "consumerGroups": { group: {
            "partitions": [0],
            "endpoint": endpoint,
            "batchSize": 10,
            "interval": "50ms"
        }}}}
    }))
    .unwrap()
}

async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn offset_row_count(store: &Arc<dyn Store>, group: &str) -> i64 {
    let result = store
        .execute(
            Statement::new(
                "SELECT COUNT(*) FROM klite_consumer_offsets WHERE consumer_group = ?",
            )
            .bind(group),
        )
        .await;
    match result {
        Ok(r) => r.rows[0].get(0).and_then(SqlValue::as_i64).unwrap_or(0),
        // The dispatcher's consumer creates the table lazily; before the
        // first commit it may not exist at all.
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------
// Successful delivery
// ---------------------------------------------------------------

#[tokio::test]
async fn test_successful_cycle_delivers_and_commits() {
    let store = memory_store().await;
    let producer = Producer::new(Arc::clone(&store));
    producer
        .send("test", 0, &json!({"msg": 1}))
        .await
        .unwrap()
        .wait_offset()
        .await
        .unwrap();

    let (endpoint, sink) = start_sink(200).await;
    let worker = DispatchWorker::new(worker_config("test", "grp", &endpoint), Arc::clone(&store))
        .unwrap();
    let shutdown = worker.shutdown_handle();
    let worker_task = tokio::spawn(worker.run());

    let bodies = Arc::clone(&sink.bodies);
    wait_for(|| !bodies.lock().unwrap().is_empty(), "sink delivery").await;

    let body = sink.bodies.lock().unwrap()[0].clone();
    assert_eq!(body["topic"], "test");
    assert_eq!(body["partition"], 0);
    assert_eq!(body["messages"][0]["offset"], 1);
    assert_eq!(body["messages"][0]["data"]["msg"], 1);
    assert!(body["messages"][0]["created"].is_string());

    // The commit lands right after the acknowledgment; poll for it.
    let consumer = Consumer::new(
        Arc::clone(&store),
        ConsumerConfig {
            group: "grp".to_string(),
        },
    );
    let mut committed = -1;
    for _ in 0..100 {
        committed = consumer.last_offset("test", 0).await.unwrap();
        if committed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(committed, 1);

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .expect("worker should stop after shutdown")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_empty_partition_makes_no_http_call() {
    let store = memory_store().await;
    let (endpoint, sink) = start_sink(200).await;

    let worker = DispatchWorker::new(worker_config("idle", "grp", &endpoint), Arc::clone(&store))
        .unwrap();
    let shutdown = worker.shutdown_handle();
    let worker_task = tokio::spawn(worker.run());

    // Let several cycles pass with nothing to deliver.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sink.bodies.lock().unwrap().is_empty());
    assert_eq!(offset_row_count(&store, "grp").await, 0);

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// ---------------------------------------------------------------
// Failure and redelivery
// ---------------------------------------------------------------

#[tokio::test]
async fn test_failed_sink_commits_nothing_and_redelivers() {
    let store = memory_store().await;
    let producer = Producer::new(Arc::clone(&store));
    producer
        .send("test", 0, &json!({"msg": 1}))
        .await
        .unwrap()
        .wait_offset()
        .await
        .unwrap();

    let (endpoint, sink) = start_sink(500).await;
    let worker = DispatchWorker::new(worker_config("test", "grp", &endpoint), Arc::clone(&store))
        .unwrap();
    let shutdown = worker.shutdown_handle();
    let worker_task = tokio::spawn(worker.run());

    // The sink keeps rejecting; at least two delivery attempts must carry
    // the same message, and no offset row may appear.
    let bodies = Arc::clone(&sink.bodies);
    wait_for(|| bodies.lock().unwrap().len() >= 2, "redelivery attempts").await;
    {
        let bodies = sink.bodies.lock().unwrap();
        assert_eq!(bodies[0]["messages"], bodies[1]["messages"]);
        assert_eq!(bodies[0]["messages"][0]["offset"], 1);
    }
    assert_eq!(offset_row_count(&store, "grp").await, 0);

    // Once the sink recovers, the same message is delivered and committed.
    sink.status.store(200, Ordering::SeqCst);
    let consumer = Consumer::new(
        Arc::clone(&store),
        ConsumerConfig {
            group: "grp".to_string(),
        },
    );
    let mut committed = -1;
    for _ in 0..100 {
        committed = consumer.last_offset("test", 0).await.unwrap();
        if committed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(committed, 1);

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_sink_is_survived() {
    let store = memory_store().await;
    let producer = Producer::new(Arc::clone(&store));
    producer
        .send("test", 0, &json!({"msg": 1}))
        .await
        .unwrap()
        .wait_offset()
        .await
        .unwrap();

    // Nothing listens here; every request fails at the transport level.
    let config = worker_config("test", "grp", "http://127.0.0.1:1/sink");
    let worker = DispatchWorker::new(config, Arc::clone(&store)).unwrap();
    let shutdown = worker.shutdown_handle();
    let worker_task = tokio::spawn(worker.run());

    // The pump keeps cycling without committing anything.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(offset_row_count(&store, "grp").await, 0);

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .expect("worker should stop even with a dead sink")
        .unwrap()
        .unwrap();
}

// ---------------------------------------------------------------
// Group independence
// ---------------------------------------------------------------

#[tokio::test]
async fn test_two_groups_on_one_topic_are_independent() {
    let store = memory_store().await;
    let producer = Producer::new(Arc::clone(&store));
    producer
        .send("test", 0, &json!({"msg": 1}))
        .await
        .unwrap()
        .wait_offset()
        .await
        .unwrap();

    let (good_endpoint, good_sink) = start_sink(200).await;
    let (bad_endpoint, bad_sink) = start_sink(500).await;

    let config = WorkerConfig::from_json(json!({
        "topics": { "test": { "consumerGroups": {
            "healthy": {
                "partitions": [0],
                "endpoint": good_endpoint,
                "batchSize": 10,
                "interval": "50ms"
            },
            "broken": {
                "partitions": [0],
                "endpoint": bad_endpoint,
                "batchSize": 10,
                "interval": "50ms"
            }
        }}}
    }))
    .unwrap();

    let worker = DispatchWorker::new(config, Arc::clone(&store)).unwrap();
    let shutdown = worker.shutdown_handle();
    let worker_task = tokio::spawn(worker.run());

    let good_bodies = Arc::clone(&good_sink.bodies);
    let bad_bodies = Arc::clone(&bad_sink.bodies);
    wait_for(
        || !good_bodies.lock().unwrap().is_empty() && !bad_bodies.lock().unwrap().is_empty(),
        "both groups to attempt delivery",
    )
    .await;

    // The healthy group commits; the broken one never does.
    let healthy = Consumer::new(
        Arc::clone(&store),
        ConsumerConfig {
            group: "healthy".to_string(),
        },
    );
    let mut committed = -1;
    for _ in 0..100 {
        committed = healthy.last_offset("test", 0).await.unwrap();
        if committed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(committed, 1);

    let broken = Consumer::new(
        Arc::clone(&store),
        ConsumerConfig {
            group: "broken".to_string(),
        },
    );
    assert_eq!(broken.last_offset("test", 0).await.unwrap(), -1);

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
