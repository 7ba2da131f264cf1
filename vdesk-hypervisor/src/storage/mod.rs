//! Private data disk storage.
//!
//! The [`StorageLifecycleManager`] owns disk and snapshot records and drives a
//! [`StorageBackend`] for the physical effect:
//!
//! - **qcow2**: qcow2 files handled by `qemu-img` on a storage host
//! - **mock**: in-memory volumes for tests and development
//!
//! Every transition is serialized per disk id. Resize, snapshot and clone
//! either complete with their effect recorded, or fail without a partial
//! effect: a failed resize leaves the size unchanged, a failed snapshot or
//! clone is kept as an `Error` record next to an unchanged source disk.

mod mock;
mod qcow2;
mod traits;
mod types;

pub use mock::{MockStorageBackend, StorageOp};
pub use qcow2::{Qcow2Backend, DEFAULT_POOL_PATH};
pub use traits::StorageBackend;
pub use types::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::attachment::AttachmentIndex;
use crate::error::{ControlError, Result};
use crate::locks::{EntityGuard, EntityLocks};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{RecordTable, INTERRUPTED};

/// Orchestrates private data disk create/resize/snapshot/clone/delete.
pub struct StorageLifecycleManager {
    backend: Arc<dyn StorageBackend>,
    disks: RecordTable<PrivateDataDisk>,
    snapshots: RecordTable<Snapshot>,
    locks: EntityLocks,
    retry: RetryPolicy,
    snapshot_sequence: AtomicU64,
}

impl StorageLifecycleManager {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        disks: RecordTable<PrivateDataDisk>,
        snapshots: RecordTable<Snapshot>,
        retry: RetryPolicy,
    ) -> Self {
        settle_interrupted(&disks, &snapshots);
        let last_sequence = snapshots.list().iter().map(|s| s.sequence).max().unwrap_or(0);
        info!(backend = backend.name(), "Storage lifecycle manager ready");
        Self {
            backend,
            disks,
            snapshots,
            locks: EntityLocks::new("disk"),
            retry,
            snapshot_sequence: AtomicU64::new(last_sequence),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn set_status(&self, id: &str, status: DiskStatus) -> Result<PrivateDataDisk> {
        self.disks.update(id, |disk| disk.transition(status))
    }

    /// Record a surfaced backend failure on the disk and return it.
    fn fail(&self, id: &str, err: ControlError) -> ControlError {
        let err = err.with_entity(id);
        error!(disk_id = %id, kind = %err.kind(), error = %err, "Disk operation failed");
        let message = err.to_string();
        if let Err(e) = self.disks.update(id, |disk| disk.fail(message)) {
            warn!(disk_id = %id, error = %e, "Failed to record disk error state");
        }
        err
    }

    /// Create a disk. The record is kept in `Error` if the backend fails.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, size_gb = request.size_gb))]
    pub async fn create_disk(&self, request: CreateDiskRequest) -> Result<PrivateDataDisk> {
        request.validate()?;
        let id = format!("pdd-{}", uuid::Uuid::new_v4());
        self.disks.insert(&id, PrivateDataDisk::creating(id.clone(), &request))?;
        let _guard = self.locks.lock(&id).await;

        let backend = self.backend.as_ref();
        let size_gb = request.size_gb;
        let disk_id = id.as_str();
        if let Err(e) = with_retry(&self.retry, "create_volume", &id, || backend.create_volume(disk_id, size_gb)).await {
            return Err(self.fail(&id, e));
        }

        info!(disk_id = %id, "Disk available");
        self.set_status(&id, DiskStatus::Available)
    }

    pub fn get_disk(&self, disk_id: &str) -> Result<PrivateDataDisk> {
        self.disks.require(disk_id)
    }

    /// All disks, optionally restricted to one tenant.
    pub fn list_disks(&self, tenant_id: Option<&str>) -> Vec<PrivateDataDisk> {
        match tenant_id {
            Some(tenant) => self.disks.filter(|d| d.tenant_id == tenant),
            None => self.disks.list(),
        }
    }

    /// Change a disk's name or description.
    #[instrument(skip(self, update))]
    pub async fn update_disk(&self, disk_id: &str, update: DiskUpdate) -> Result<PrivateDataDisk> {
        let _guard = self.locks.lock(disk_id).await;
        self.disks.update(disk_id, |disk| {
            if let Some(name) = update.name {
                disk.name = Some(name);
            }
            if let Some(description) = update.description {
                disk.description = Some(description);
            }
            disk.updated_at = Utc::now();
        })
    }

    /// Grow an available disk.
    #[instrument(skip(self))]
    pub async fn resize_disk(&self, disk_id: &str, new_size_gb: u64) -> Result<PrivateDataDisk> {
        let _guard = self.locks.lock(disk_id).await;
        let disk = self.disks.require(disk_id)?;
        if disk.status != DiskStatus::Available {
            return Err(ControlError::invalid_state(
                disk_id,
                format!("cannot resize a disk that is {}", disk.status),
            ));
        }
        if new_size_gb <= disk.size_gb {
            return Err(ControlError::validation(
                disk_id,
                format!("new size {}GB must exceed current size {}GB", new_size_gb, disk.size_gb),
            ));
        }

        self.set_status(disk_id, DiskStatus::Resizing)?;
        let backend = self.backend.as_ref();
        if let Err(e) = with_retry(&self.retry, "resize_volume", disk_id, || backend.resize_volume(disk_id, new_size_gb)).await {
            return Err(self.fail(disk_id, e));
        }

        info!(disk_id = %disk_id, from_gb = disk.size_gb, to_gb = new_size_gb, "Disk resized");
        self.disks.update(disk_id, |disk| {
            disk.size_gb = new_size_gb;
            disk.transition(DiskStatus::Available);
        })
    }

    /// Snapshot an available or attached disk.
    ///
    /// The disk shows `SnapshotInProgress` only while a backend that needs
    /// quiescing takes the snapshot, and returns to its previous status
    /// whatever the outcome.
    #[instrument(skip(self))]
    pub async fn snapshot_disk(&self, disk_id: &str) -> Result<Snapshot> {
        let _guard = self.locks.lock(disk_id).await;
        let disk = self.disks.require(disk_id)?;
        let previous = disk.status;
        if !matches!(previous, DiskStatus::Available | DiskStatus::Attached) {
            return Err(ControlError::invalid_state(
                disk_id,
                format!("cannot snapshot a disk that is {}", previous),
            ));
        }

        let snapshot = Snapshot {
            id: format!("snap-{}", uuid::Uuid::new_v4()),
            disk_id: disk_id.to_string(),
            status: SnapshotStatus::Creating,
            last_error: None,
            created_at: Utc::now(),
            sequence: self.snapshot_sequence.fetch_add(1, Ordering::SeqCst) + 1,
        };
        self.snapshots.insert(&snapshot.id, snapshot.clone())?;

        let quiesce = self.backend.requires_quiesce();
        if quiesce {
            self.set_status(disk_id, DiskStatus::SnapshotInProgress)?;
        }

        let backend = self.backend.as_ref();
        let snapshot_id = snapshot.id.as_str();
        let result = with_retry(&self.retry, "create_snapshot", disk_id, || backend.create_snapshot(disk_id, snapshot_id)).await;

        if quiesce {
            self.set_status(disk_id, previous)?;
        }

        match result {
            Ok(()) => {
                info!(disk_id = %disk_id, snapshot_id = %snapshot.id, "Snapshot available");
                self.snapshots.update(&snapshot.id, |s| s.status = SnapshotStatus::Available)
            }
            Err(e) => {
                let err = e.with_entity(&snapshot.id);
                error!(disk_id = %disk_id, snapshot_id = %snapshot.id, error = %err, "Snapshot failed");
                let message = err.to_string();
                self.snapshots.update(&snapshot.id, |s| {
                    s.status = SnapshotStatus::Error;
                    s.last_error = Some(message);
                })?;
                Err(err)
            }
        }
    }

    /// Snapshots of a disk in creation order.
    pub fn list_snapshots(&self, disk_id: &str) -> Result<Vec<Snapshot>> {
        self.disks.require(disk_id)?;
        let mut snapshots = self.snapshots.filter(|s| s.disk_id == disk_id);
        snapshots.sort_by_key(|s| (s.created_at, s.sequence));
        Ok(snapshots)
    }

    /// Copy an available disk into a new disk of the same size and tenant.
    ///
    /// The source shows `Cloning` during the copy and returns to `Available`
    /// whatever the outcome. A failed clone is kept in `Error`.
    #[instrument(skip(self))]
    pub async fn clone_disk(&self, disk_id: &str, name: Option<String>) -> Result<PrivateDataDisk> {
        let _guard = self.locks.lock(disk_id).await;
        let source = self.disks.require(disk_id)?;
        if source.status != DiskStatus::Available {
            return Err(ControlError::invalid_state(
                disk_id,
                format!("cannot clone a disk that is {}", source.status),
            ));
        }

        let clone_id = format!("pdd-{}", uuid::Uuid::new_v4());
        let request = CreateDiskRequest {
            tenant_id: source.tenant_id.clone(),
            size_gb: source.size_gb,
            name,
            description: source.description.clone(),
        };
        let mut clone = PrivateDataDisk::creating(clone_id.clone(), &request);
        clone.lineage = Some(disk_id.to_string());
        self.disks.insert(&clone_id, clone)?;
        let _clone_guard = self.locks.lock(&clone_id).await;

        self.set_status(disk_id, DiskStatus::Cloning)?;
        let backend = self.backend.as_ref();
        let dest = clone_id.as_str();
        let result = with_retry(&self.retry, "clone_volume", &clone_id, || backend.clone_volume(disk_id, dest)).await;
        self.set_status(disk_id, DiskStatus::Available)?;

        if let Err(e) = result {
            return Err(self.fail(&clone_id, e));
        }

        info!(disk_id = %disk_id, clone_id = %clone_id, "Disk cloned");
        self.set_status(&clone_id, DiskStatus::Available)
    }

    /// Delete a disk from `Available` or `Error` with no active attachments.
    /// Its snapshots go with it.
    #[instrument(skip(self, attachments))]
    pub async fn delete_disk(&self, disk_id: &str, attachments: &dyn AttachmentIndex) -> Result<()> {
        let _guard = self.locks.lock(disk_id).await;
        let disk = self.disks.require(disk_id)?;

        let active = attachments.active_for_disk(disk_id);
        if let Some(attachment) = active.first() {
            return Err(ControlError::conflict(
                disk_id,
                format!("disk is attached to {}", attachment.vm_id),
            ));
        }
        if !matches!(disk.status, DiskStatus::Available | DiskStatus::Error) {
            return Err(ControlError::invalid_state(
                disk_id,
                format!("cannot delete a disk that is {}", disk.status),
            ));
        }

        self.set_status(disk_id, DiskStatus::Deleting)?;
        let backend = self.backend.as_ref();
        match with_retry(&self.retry, "delete_volume", disk_id, || backend.delete_volume(disk_id)).await {
            Ok(()) => {}
            Err(ControlError::NotFound { .. }) => {
                warn!(disk_id = %disk_id, "Volume already absent on backend");
            }
            Err(e) => return Err(self.fail(disk_id, e)),
        }

        self.snapshots.remove_where(|s| s.disk_id == disk_id)?;
        self.disks.remove(disk_id)?;
        info!(disk_id = %disk_id, "Disk deleted");
        Ok(())
    }

    /// Take the disk's entity lock.
    pub(crate) async fn lock_disk(&self, disk_id: &str) -> EntityGuard {
        self.locks.lock(disk_id).await
    }

    /// Set the status of a disk whose lock the caller holds.
    pub(crate) fn set_status_locked(
        &self,
        guard: &EntityGuard,
        status: DiskStatus,
        last_error: Option<String>,
    ) -> Result<PrivateDataDisk> {
        self.disks.update(guard.id(), |disk| match last_error {
            Some(message) if status == DiskStatus::Error => disk.fail(message),
            _ => disk.transition(status),
        })
    }

    /// Put a disk into `Error` while the manager is being assembled.
    pub(crate) fn mark_interrupted(&self, disk_id: &str) -> Result<PrivateDataDisk> {
        self.disks.update(disk_id, |disk| disk.fail(INTERRUPTED))
    }

    pub(crate) fn volume_location(&self, disk_id: &str) -> VolumeLocation {
        self.backend.volume_location(disk_id)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// Move disks and snapshots left mid-operation by a previous process to `Error`.
fn settle_interrupted(disks: &RecordTable<PrivateDataDisk>, snapshots: &RecordTable<Snapshot>) {
    for disk in disks.filter(|d| d.status.is_in_progress()) {
        warn!(disk_id = %disk.id, status = %disk.status, "Disk operation interrupted by restart");
        if let Err(e) = disks.update(&disk.id, |d| d.fail(INTERRUPTED)) {
            warn!(disk_id = %disk.id, error = %e, "Failed to settle interrupted disk");
        }
    }
    for snapshot in snapshots.filter(|s| s.status == SnapshotStatus::Creating) {
        warn!(snapshot_id = %snapshot.id, disk_id = %snapshot.disk_id, "Snapshot interrupted by restart");
        if let Err(e) = snapshots.update(&snapshot.id, |s| {
            s.status = SnapshotStatus::Error;
            s.last_error = Some(INTERRUPTED.to_string());
        }) {
            warn!(snapshot_id = %snapshot.id, error = %e, "Failed to settle interrupted snapshot");
        }
    }
}
