//! In-memory snapshot store for projection tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use fulfillment_core::projection::{ProjectionSnapshot, Result, SnapshotStore};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// HashMap-backed [`SnapshotStore`] that counts saves.
///
/// # Example
///
/// ```
/// use fulfillment_core::projection::{ProjectionSnapshot, SnapshotStore};
/// use fulfillment_testing::InMemorySnapshotStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemorySnapshotStore::new();
/// let now = chrono::Utc::now();
/// let snapshot = ProjectionSnapshot::empty("analytics", serde_json::json!({}), now);
/// store.save(snapshot).await?;
/// assert!(store.load("analytics").await?.is_some());
/// assert_eq!(store.save_count(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<String, ProjectionSnapshot>>>,
    saves: Arc<RwLock<usize>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored snapshot of `projection`, without going through the async API.
    #[must_use]
    pub fn get(&self, projection: &str) -> Option<ProjectionSnapshot> {
        self.snapshots.read().unwrap().get(projection).cloned()
    }

    /// How many times `save` was called.
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.read().unwrap()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(
        &self,
        projection: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionSnapshot>>> + Send + '_>> {
        let snapshot = self.get(projection);
        Box::pin(async move { Ok(snapshot) })
    }

    fn save(
        &self,
        snapshot: ProjectionSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.saves.write().unwrap() += 1;
            self.snapshots
                .write()
                .unwrap()
                .insert(snapshot.projection.clone(), snapshot);
            Ok(())
        })
    }

    fn clear(&self, projection: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.snapshots.write().unwrap().remove(projection);
        Box::pin(async { Ok(()) })
    }
}
