//! Snapshot persistence for replayable projections.
//!
//! A projection folds an event stream into a read model. To survive restarts
//! without double counting, it persists its state together with the log
//! positions that state covers, and only then commits those positions to the
//! broker.
//!
//! ```text
//! fold events ──► save snapshot {state, positions} ──► commit offsets
//!                        │
//!  restart ◄─────────────┘  load snapshot, skip offsets below `positions`
//! ```
//!
//! A crash between save and commit redelivers records the snapshot already
//! covers; they are skipped by position. A crash before save loses only
//! uncommitted work, which is redelivered and folded again.

use crate::event_bus::DeliveryPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur in projection operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Persisted state of a projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSnapshot {
    /// Projection name
    pub projection: String,
    /// Next offset to fold, per topic and partition
    pub positions: BTreeMap<String, BTreeMap<i32, i64>>,
    /// Serialized read model
    pub state: serde_json::Value,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl ProjectionSnapshot {
    /// An empty snapshot at the start of every partition.
    #[must_use]
    pub fn empty(
        projection: impl Into<String>,
        state: serde_json::Value,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            projection: projection.into(),
            positions: BTreeMap::new(),
            state,
            taken_at,
        }
    }

    /// Whether the record at `position` is already folded into `state`.
    #[must_use]
    pub fn covers(&self, position: &DeliveryPosition) -> bool {
        self.positions
            .get(&position.topic)
            .and_then(|partitions| partitions.get(&position.partition))
            .is_some_and(|next| position.offset < *next)
    }

    /// Record that everything up to and including `position` is folded.
    pub fn advance(&mut self, position: &DeliveryPosition) {
        let next = position.offset + 1;
        let entry = self
            .positions
            .entry(position.topic.clone())
            .or_default()
            .entry(position.partition)
            .or_insert(next);
        *entry = (*entry).max(next);
    }
}

/// Durable storage for projection snapshots.
///
/// # Example
///
/// ```ignore
/// let store = FileSnapshotStore::new("metrics_report.json");
///
/// if let Some(snapshot) = store.load("analytics").await? {
///     resume_from(snapshot);
/// }
/// store.save(snapshot).await?;
/// ```
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns so consumers can
/// hold `Arc<dyn SnapshotStore>`.
pub trait SnapshotStore: Send + Sync {
    /// Load the latest snapshot, `None` if the projection never saved one.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] or
    /// [`ProjectionError::Serialization`] if loading fails.
    fn load(
        &self,
        projection: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionSnapshot>>> + Send + '_>>;

    /// Replace the stored snapshot. Either the old or the new snapshot is
    /// visible afterwards, never a partial write.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the write fails.
    fn save(
        &self,
        snapshot: ProjectionSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Discard the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if removal fails.
    fn clear(&self, projection: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_only_folded_offsets() {
        let mut snapshot =
            ProjectionSnapshot::empty("analytics", serde_json::Value::Null, Utc::now());
        let folded = DeliveryPosition::new("inventory.reserved", 1, 4);
        snapshot.advance(&folded);

        assert!(snapshot.covers(&DeliveryPosition::new("inventory.reserved", 1, 0)));
        assert!(snapshot.covers(&folded));
        assert!(!snapshot.covers(&DeliveryPosition::new("inventory.reserved", 1, 5)));
        assert!(!snapshot.covers(&DeliveryPosition::new("inventory.reserved", 0, 0)));
        assert!(!snapshot.covers(&DeliveryPosition::new("inventory.failed", 1, 0)));
    }

    #[test]
    fn advance_is_monotonic() {
        let mut snapshot =
            ProjectionSnapshot::empty("analytics", serde_json::Value::Null, Utc::now());
        snapshot.advance(&DeliveryPosition::new("t", 0, 9));
        snapshot.advance(&DeliveryPosition::new("t", 0, 3));
        assert_eq!(snapshot.positions["t"][&0], 10);
    }
}
