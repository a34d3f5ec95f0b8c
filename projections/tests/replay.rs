//! Replay tests: the analytics projection rebuilt from history must match the
//! one built live, down to the bytes of the persisted report.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use fulfillment_core::projection::SnapshotStore;
use fulfillment_projections::{AnalyticsConfig, AnalyticsConsumer, FileSnapshotStore};
use fulfillment_runtime::{InventoryConfig, InventoryConsumer, LagMonitor, RetryPolicy};
use fulfillment_testing::{InMemoryEventBus, InMemoryInventoryStore, helpers, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(1)
        .initial_delay(Duration::from_millis(1))
        .jitter(0.0)
        .attempt_timeout(Duration::from_millis(200))
        .build()
}

async fn drain(bus: &InMemoryEventBus, group: &str, topics: &[String]) {
    LagMonitor::new(Arc::new(bus.clone()))
        .wait_for_drain(group, topics, Duration::from_secs(5), Duration::from_millis(5))
        .await
        .expect("group should drain");
}

/// Run the inventory consumer over everything published so far.
async fn fulfill(bus: &InMemoryEventBus, store: &InMemoryInventoryStore) {
    let config = InventoryConfig {
        poll_timeout: Duration::from_millis(10),
        broker_retry: retry(),
        ..InventoryConfig::default()
    };
    let consumer = InventoryConsumer::new(Arc::new(bus.clone()), Arc::new(store.clone()), config)
        .with_clock(Arc::new(test_clock()));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(consumer.run(rx));
    drain(bus, "inventory-service", &["order.placed".to_string()]).await;
    tx.send_replace(true);
    handle.await.unwrap().unwrap();
}

fn analytics(bus: &InMemoryEventBus, snapshots: &FileSnapshotStore) -> AnalyticsConsumer {
    let config = AnalyticsConfig {
        flush_every: 7,
        poll_timeout: Duration::from_millis(10),
        broker_retry: retry(),
        ..AnalyticsConfig::default()
    };
    AnalyticsConsumer::new(Arc::new(bus.clone()), Arc::new(snapshots.clone()), config)
        .with_clock(Arc::new(test_clock()))
}

/// Run the analytics consumer until its group has no lag, return the report bytes.
async fn project(
    consumer: AnalyticsConsumer,
    bus: &InMemoryEventBus,
    snapshots: &FileSnapshotStore,
) -> Vec<u8> {
    let topics = AnalyticsConfig::default().topics;
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { consumer.run(rx).await });
    drain(bus, "analytics-service", &topics).await;
    tx.send_replace(true);
    handle.await.unwrap().unwrap();

    let snapshot = snapshots.load("analytics").await.unwrap().unwrap();
    serde_json::to_vec(&snapshot.state).unwrap()
}

#[tokio::test]
async fn replay_reproduces_the_live_report() {
    helpers::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let snapshots = FileSnapshotStore::new(dir.path().join("metrics_report.json"));
    let bus = InMemoryEventBus::new();
    let store = InMemoryInventoryStore::with_stock([("burger", 10), ("pizza", 5)]);

    for n in 0..25 {
        let item = if n % 3 == 0 { "pizza" } else { "burger" };
        helpers::publish_order(&bus, "order.placed", &format!("o{n}"), item, 1).await;
    }
    helpers::publish_raw(&bus, "order.placed", "junk", b"[1,2,3]".to_vec()).await;
    fulfill(&bus, &store).await;

    let live = project(analytics(&bus, &snapshots), &bus, &snapshots).await;

    let replaying = analytics(&bus, &snapshots);
    replaying.reset(&bus).await.unwrap();
    let replayed = project(replaying, &bus, &snapshots).await;

    assert_eq!(live, replayed);
    let report: serde_json::Value = serde_json::from_slice(&replayed).unwrap();
    assert_eq!(report["total_orders"], 25);
    assert_eq!(report["total_reserved"], 15);
    assert_eq!(report["total_failed"], 10);
    assert_eq!(report["invalid_events"], 1);
    assert_eq!(report["failure_reasons"]["out_of_stock"], 10);
}

#[tokio::test]
async fn restart_continues_without_double_counting() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = FileSnapshotStore::new(dir.path().join("metrics_report.json"));
    let bus = InMemoryEventBus::new();
    let store = InMemoryInventoryStore::with_stock([("burger", 100)]);

    for n in 0..10 {
        helpers::publish_order(&bus, "order.placed", &format!("a{n}"), "burger", 1).await;
    }
    fulfill(&bus, &store).await;
    project(analytics(&bus, &snapshots), &bus, &snapshots).await;

    for n in 0..10 {
        helpers::publish_order(&bus, "order.placed", &format!("b{n}"), "burger", 1).await;
    }
    fulfill(&bus, &store).await;
    let report = project(analytics(&bus, &snapshots), &bus, &snapshots).await;

    let report: serde_json::Value = serde_json::from_slice(&report).unwrap();
    assert_eq!(report["total_orders"], 20);
    assert_eq!(report["total_reserved"], 20);
    assert_eq!(report["by_event_type"]["InventoryReserved"]["count"], 20);
}
