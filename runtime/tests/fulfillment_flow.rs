//! End-to-end tests of the inventory consumer over the in-memory broker.
//!
//! These exercise behavior that spans consumer runs: restarts resuming from
//! committed offsets, redelivered backlogs staying idempotent, and lag
//! draining to zero.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use fulfillment_core::event_bus::{EventBus, OffsetAdmin, OffsetResetRequest, OffsetResetTarget};
use fulfillment_runtime::{
    ConsumerError, InventoryConfig, InventoryConsumer, InventoryStats, LagMonitor, RetryPolicy,
};
use fulfillment_testing::{InMemoryEventBus, InMemoryInventoryStore, helpers};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const ORDERS: &str = "order.placed";
const GROUP: &str = "inventory-service";

fn config() -> InventoryConfig {
    InventoryConfig {
        shards: 4,
        poll_timeout: Duration::from_millis(10),
        dependency_timeout: Duration::from_millis(200),
        broker_retry: RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .jitter(0.0)
            .attempt_timeout(Duration::from_millis(200))
            .build(),
        ..InventoryConfig::default()
    }
}

async fn run_until_drained(
    bus: &InMemoryEventBus,
    store: &InMemoryInventoryStore,
) -> Result<InventoryStats, ConsumerError> {
    let consumer = InventoryConsumer::new(Arc::new(bus.clone()), Arc::new(store.clone()), config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(consumer.run(shutdown_rx));

    LagMonitor::new(Arc::new(bus.clone()))
        .wait_for_drain(
            GROUP,
            &[ORDERS.to_string()],
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await
        .expect("backlog should drain");

    shutdown_tx.send_replace(true);
    handle.await.expect("consumer task should not panic")
}

#[tokio::test]
async fn restart_resumes_from_committed_offsets() {
    helpers::init_test_tracing();
    let bus = InMemoryEventBus::new();
    let store = InMemoryInventoryStore::with_stock([("burger", 100), ("pizza", 50)]);

    for n in 0..10 {
        helpers::publish_order(&bus, ORDERS, &format!("a{n}"), "burger", 1).await;
    }
    let first = run_until_drained(&bus, &store).await.unwrap();
    assert_eq!(first.reserved, 10);

    for n in 0..5 {
        helpers::publish_order(&bus, ORDERS, &format!("b{n}"), "pizza", 2).await;
    }
    let second = run_until_drained(&bus, &store).await.unwrap();

    assert_eq!(second.reserved, 5);
    assert_eq!(second.duplicates, 0);
    assert_eq!(store.available("burger"), Some(90));
    assert_eq!(store.available("pizza"), Some(40));
    assert_eq!(bus.record_count("inventory.reserved"), 15);
}

#[tokio::test]
async fn replayed_backlog_is_suppressed_by_the_ledger() {
    let bus = InMemoryEventBus::new();
    let store = InMemoryInventoryStore::with_stock([("burger", 100)]);
    for n in 0..8 {
        helpers::publish_order(&bus, ORDERS, &format!("o{n}"), "burger", 2).await;
    }
    run_until_drained(&bus, &store).await.unwrap();

    // Offsets lost: the whole topic is delivered again.
    bus.reset_offsets(OffsetResetRequest {
        consumer_group: GROUP.to_string(),
        topics: vec![ORDERS.to_string()],
        target: OffsetResetTarget::Earliest,
    })
    .await
    .unwrap();
    let replay = run_until_drained(&bus, &store).await.unwrap();

    assert_eq!(replay.duplicates, 8);
    assert_eq!(replay.reserved, 0);
    assert_eq!(store.available("burger"), Some(84));
    assert_eq!(bus.record_count("inventory.reserved"), 8);
}

#[tokio::test]
async fn mixed_traffic_settles_every_message() {
    let bus = InMemoryEventBus::new();
    let store = InMemoryInventoryStore::with_stock([("burger", 3)]);
    for n in 0..5 {
        helpers::publish_order(&bus, ORDERS, &format!("o{n}"), "burger", 1).await;
    }
    helpers::publish_raw(&bus, ORDERS, "junk", b"not json".to_vec()).await;
    let negative = br#"{"order_id":"neg","item":"burger","qty":-1}"#;
    helpers::publish_raw(&bus, ORDERS, "neg", negative.to_vec()).await;

    let stats = run_until_drained(&bus, &store).await.unwrap();

    assert_eq!(stats.reserved, 3);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.dead_lettered, 2);
    assert_eq!(stats.acknowledged(), 7);
    assert_eq!(store.available("burger"), Some(0));
    assert_eq!(bus.record_count("inventory.failed"), 2);
    assert_eq!(bus.record_count("order.placed.dlq"), 2);
}

#[tokio::test]
async fn group_is_released_after_shutdown() {
    let bus = InMemoryEventBus::new();
    let store = InMemoryInventoryStore::with_stock([("burger", 10)]);
    helpers::publish_order(&bus, ORDERS, "o1", "burger", 1).await;
    run_until_drained(&bus, &store).await.unwrap();

    assert!(!bus.is_group_active(GROUP));
    let subscription = bus.subscribe(GROUP, &[ORDERS.to_string()]).await;
    assert!(subscription.is_ok());
}
