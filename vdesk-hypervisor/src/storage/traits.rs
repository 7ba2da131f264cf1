//! Storage backend trait definition.

use async_trait::async_trait;

use super::types::VolumeLocation;
use crate::error::Result;

/// A block-volume backend for private data disks.
///
/// The [`super::StorageLifecycleManager`] owns disk state and calls into the
/// backend only for the physical effect. Operations must be safe to repeat
/// after a transient failure.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether a snapshot requires the volume to be quiesced while it is taken.
    fn requires_quiesce(&self) -> bool;

    /// Where the hypervisor finds the volume for `volume_id`.
    fn volume_location(&self, volume_id: &str) -> VolumeLocation;

    /// Create an empty volume.
    async fn create_volume(&self, volume_id: &str, size_gb: u64) -> Result<()>;

    /// Grow a volume. Shrinking is never requested.
    async fn resize_volume(&self, volume_id: &str, new_size_gb: u64) -> Result<()>;

    /// Take a point-in-time snapshot of a volume.
    async fn create_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<()>;

    /// Copy a volume into a new one.
    async fn clone_volume(&self, source_id: &str, dest_id: &str) -> Result<()>;

    /// Delete a volume and its snapshots. Deleting a missing volume is `NotFound`.
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
}
