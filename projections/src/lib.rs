//! Analytics projection for order fulfillment.
//!
//! # Overview
//!
//! - **[`AnalyticsAggregates`]**: pure fold of order and outcome events into
//!   counts, per-minute order volume, latency tallies and failure reasons
//! - **[`AnalyticsConsumer`]**: independent consumer group that folds the
//!   stream, checkpoints through a snapshot store and supports replay from the
//!   earliest offsets
//! - **[`FileSnapshotStore`]**: atomic JSON file snapshots
//!
//! # Replay
//!
//! ```ignore
//! use fulfillment_projections::{AnalyticsConfig, AnalyticsConsumer, FileSnapshotStore};
//!
//! let consumer = AnalyticsConsumer::new(
//!     bus,
//!     Arc::new(FileSnapshotStore::new("metrics_report.json")),
//!     AnalyticsConfig::default(),
//! );
//!
//! // Group must be idle: the broker refuses resets with an active member.
//! let aggregates = consumer.replay(admin.as_ref(), shutdown_rx).await?;
//! ```

pub mod analytics;
pub mod consumer;
pub mod file_store;

pub use analytics::{AnalyticsAggregates, EventTally, LatencyTally};
pub use consumer::{AnalyticsConfig, AnalyticsConsumer};
pub use file_store::FileSnapshotStore;
