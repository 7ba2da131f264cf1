//! In-memory storage backend for tests and `--dev`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::traits::StorageBackend;
use super::types::VolumeLocation;
use crate::error::{ControlError, Result};

/// Storage operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Create,
    Resize,
    Snapshot,
    Clone,
    Delete,
}

#[derive(Debug, Clone, Default)]
struct MockVolume {
    size_gb: u64,
    snapshots: Vec<String>,
}

/// Volumes kept in a map; no data is stored.
pub struct MockStorageBackend {
    volumes: Mutex<HashMap<String, MockVolume>>,
    quiesce: AtomicBool,
    failures: Mutex<VecDeque<(StorageOp, ControlError)>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<StorageOp, usize>>,
}

impl Default for MockStorageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStorageBackend {
    pub fn new() -> Self {
        Self {
            volumes: Mutex::new(HashMap::new()),
            quiesce: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_requires_quiesce(&self, quiesce: bool) {
        self.quiesce.store(quiesce, Ordering::SeqCst);
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: StorageOp, error: ControlError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((op, error));
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub fn calls(&self, op: StorageOp) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Size of a volume, if it exists.
    pub fn volume_size(&self, volume_id: &str) -> Option<u64> {
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(volume_id)
            .map(|v| v.size_gb)
    }

    pub fn snapshot_count(&self, volume_id: &str) -> usize {
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(volume_id)
            .map(|v| v.snapshots.len())
            .unwrap_or(0)
    }

    async fn enter(&self, op: StorageOp) -> Result<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(op)
            .or_insert(0) += 1;

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = failures.iter().position(|(o, _)| *o == op) {
            if let Some((_, error)) = failures.remove(pos) {
                debug!(?op, error = %error, "Injected storage failure");
                return Err(error);
            }
        }
        Ok(())
    }

    fn with_volume<T>(&self, volume_id: &str, f: impl FnOnce(&mut MockVolume) -> T) -> Result<T> {
        let mut volumes = self.volumes.lock().unwrap_or_else(|e| e.into_inner());
        volumes
            .get_mut(volume_id)
            .map(f)
            .ok_or_else(|| ControlError::not_found(volume_id))
    }
}

#[async_trait]
impl StorageBackend for MockStorageBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn requires_quiesce(&self) -> bool {
        self.quiesce.load(Ordering::SeqCst)
    }

    fn volume_location(&self, volume_id: &str) -> VolumeLocation {
        VolumeLocation {
            host_id: None,
            source: format!("/mock/disks/{}.qcow2", volume_id),
            format: "qcow2".to_string(),
        }
    }

    async fn create_volume(&self, volume_id: &str, size_gb: u64) -> Result<()> {
        self.enter(StorageOp::Create).await?;
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(volume_id.to_string(), MockVolume { size_gb, snapshots: Vec::new() });
        Ok(())
    }

    async fn resize_volume(&self, volume_id: &str, new_size_gb: u64) -> Result<()> {
        self.enter(StorageOp::Resize).await?;
        self.with_volume(volume_id, |v| {
            if new_size_gb < v.size_gb {
                return Err(ControlError::validation(volume_id, "shrinking is not supported"));
            }
            v.size_gb = new_size_gb;
            Ok(())
        })?
    }

    async fn create_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<()> {
        self.enter(StorageOp::Snapshot).await?;
        self.with_volume(volume_id, |v| {
            if !v.snapshots.iter().any(|s| s == snapshot_id) {
                v.snapshots.push(snapshot_id.to_string());
            }
        })
    }

    async fn clone_volume(&self, source_id: &str, dest_id: &str) -> Result<()> {
        self.enter(StorageOp::Clone).await?;
        let size_gb = self.with_volume(source_id, |v| v.size_gb)?;
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dest_id.to_string(), MockVolume { size_gb, snapshots: Vec::new() });
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.enter(StorageOp::Delete).await?;
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(volume_id)
            .map(|_| ())
            .ok_or_else(|| ControlError::not_found(volume_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let backend = MockStorageBackend::new();
        backend.create_volume("pdd-1", 50).await.unwrap();
        backend.resize_volume("pdd-1", 80).await.unwrap();
        assert!(backend.resize_volume("pdd-1", 40).await.is_err());

        backend.clone_volume("pdd-1", "pdd-2").await.unwrap();
        assert_eq!(backend.volume_size("pdd-2"), Some(80));

        backend.create_snapshot("pdd-1", "snap-1").await.unwrap();
        backend.create_snapshot("pdd-1", "snap-1").await.unwrap();
        assert_eq!(backend.snapshot_count("pdd-1"), 1);

        backend.delete_volume("pdd-1").await.unwrap();
        assert!(matches!(backend.delete_volume("pdd-1").await, Err(ControlError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_failure_injection_is_one_shot() {
        let backend = MockStorageBackend::new();
        backend.fail_next(StorageOp::Create, ControlError::capacity("pool", "full"));
        assert!(backend.create_volume("pdd-1", 10).await.is_err());
        backend.create_volume("pdd-1", 10).await.unwrap();
        assert_eq!(backend.calls(StorageOp::Create), 2);
    }
}
