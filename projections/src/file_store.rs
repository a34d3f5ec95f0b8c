//! JSON file snapshot store.
//!
//! One file holds one projection's snapshot, pretty-printed so operators can
//! read the analytics report directly. Writes go to a sibling temp file that
//! is then renamed over the target, so readers see the old or the new
//! snapshot and never a torn one. The temp file and the directory entry are
//! synced before `save` returns, since offsets are committed right after.

use fulfillment_core::projection::{ProjectionError, ProjectionSnapshot, Result, SnapshotStore};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;

/// [`SnapshotStore`] backed by a single JSON file.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store snapshots at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_durably(&self, bytes: &[u8]) -> Result<()> {
        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| io_error("create", &temp, &e))?;
        file.write_all(bytes).await.map_err(|e| io_error("write", &temp, &e))?;
        file.sync_all().await.map_err(|e| io_error("sync", &temp, &e))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| io_error("replace", &self.path, &e))?;
        self.sync_dir().await
    }

    /// Persist the rename itself.
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let handle = tokio::fs::File::open(dir).await.map_err(|e| io_error("open", dir, &e))?;
        handle.sync_all().await.map_err(|e| io_error("sync", dir, &e))
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_async)]
    async fn sync_dir(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self) -> Result<Option<ProjectionSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProjectionError::Storage(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            },
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ProjectionError::Serialization(format!("{}: {e}", self.path.display())))
    }
}

fn io_error(action: &str, path: &Path, error: &std::io::Error) -> ProjectionError {
    ProjectionError::Storage(format!("failed to {action} {}: {error}", path.display()))
}

impl SnapshotStore for FileSnapshotStore {
    fn load(
        &self,
        projection: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionSnapshot>>> + Send + '_>> {
        let projection = projection.to_string();
        Box::pin(async move {
            let snapshot = self.read().await?;
            Ok(snapshot.filter(|s| s.projection == projection))
        })
    }

    fn save(
        &self,
        snapshot: ProjectionSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let bytes = serde_json::to_vec_pretty(&snapshot)
                .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
            self.write_durably(&bytes).await?;
            tracing::debug!(
                path = %self.path.display(),
                projection = %snapshot.projection,
                "Snapshot written"
            );
            Ok(())
        })
    }

    fn clear(&self, projection: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let projection = projection.to_string();
        Box::pin(async move {
            if self.read().await?.is_none_or(|s| s.projection != projection) {
                return Ok(());
            }
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ProjectionError::Storage(format!(
                    "failed to remove {}: {e}",
                    self.path.display()
                ))),
            }
        })
    }
}
