//! # Fulfillment Runtime
//!
//! The processing side of order fulfillment: the inventory reservation
//! consumer, dead-letter routing, consumer-lag monitoring, retry policy and
//! Prometheus metrics.
//!
//! ## Core Components
//!
//! - **[`InventoryConsumer`]**: consumes `order.placed`, reserves stock exactly
//!   once per `order_id`, publishes `InventoryReserved` / `InventoryFailed`
//! - **[`DeadLetterRouter`]**: isolates poison messages on the dead-letter topic
//! - **[`LagMonitor`]**: read-only lag reporting, drain waits, throttle advice
//! - **[`RetryPolicy`]**: bounded exponential backoff for broker calls
//!
//! ## Example
//!
//! ```ignore
//! use fulfillment_runtime::{InventoryConfig, InventoryConsumer};
//! use tokio::sync::watch;
//!
//! let consumer = InventoryConsumer::new(bus, store, InventoryConfig::default());
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown_tx.send_replace(true);
//! });
//!
//! let stats = consumer.run(shutdown_rx).await?;
//! println!("reserved {} orders", stats.reserved);
//! ```

/// Dead-letter routing
pub mod dead_letter;

/// Error taxonomy of the consumers
pub mod error;

/// Fault injection for the inventory consumer
pub mod fault;

/// Inventory reservation consumer
pub mod inventory;

/// Consumer-lag monitoring
pub mod lag;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Shard routing
pub mod shard;

pub use dead_letter::{DeadLetterRouter, Routed};
pub use error::{ConsumerError, ProcessingError, TransientDependencyError};
pub use fault::{FaultInjection, FaultSwitch};
pub use inventory::{Fate, InventoryConfig, InventoryConsumer, InventoryStats};
pub use lag::{LagMonitor, LagReport, LagWatch, ThrottleAdvice};
pub use retry::{RetryPolicy, retry_broker, retry_with_backoff};
