//! qcow2 files managed with `qemu-img` on a storage host.
//!
//! Every volume is `<pool>/<volume_id>.qcow2` on the host named by the
//! handle; snapshots are internal qcow2 snapshots and go away with the file.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::traits::StorageBackend;
use super::types::VolumeLocation;
use crate::connection::{first_line, HostHandle, RemoteOutput, RemoteRequest};
use crate::error::{ControlError, Result};

/// Default directory for volumes on the storage host.
pub const DEFAULT_POOL_PATH: &str = "/var/lib/vdesk/disks";

/// qcow2 storage backend reached over the host's SSH connection.
pub struct Qcow2Backend {
    host: HostHandle,
    pool_path: String,
    qemu_img: String,
}

impl Qcow2Backend {
    pub fn new(host: HostHandle, pool_path: impl Into<String>) -> Self {
        Self {
            host,
            pool_path: pool_path.into().trim_end_matches('/').to_string(),
            qemu_img: "qemu-img".to_string(),
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_qemu_img(mut self, path: impl Into<String>) -> Self {
        self.qemu_img = path.into();
        self
    }

    fn volume_path(&self, volume_id: &str) -> String {
        format!("{}/{}.qcow2", self.pool_path, volume_id)
    }

    async fn run(&self, entity: &str, program: &str, args: &[&str]) -> Result<String> {
        let output = self.host.run(RemoteRequest::shell(program, args.to_vec())).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify(entity, &output))
        }
    }

    async fn qemu_img(&self, entity: &str, args: &[&str]) -> Result<String> {
        self.run(entity, &self.qemu_img, args).await
    }

    async fn ensure_pool(&self) -> Result<()> {
        self.run(&self.pool_path, "mkdir", &["-p", self.pool_path.as_str()]).await?;
        Ok(())
    }
}

fn classify(entity: &str, output: &RemoteOutput) -> ControlError {
    let message = first_line(&output.stderr).to_string();
    let lower = output.stderr.to_lowercase();

    if lower.contains("no such file") || lower.contains("could not open") {
        ControlError::not_found(entity)
    } else if lower.contains("no space left") || lower.contains("disk quota exceeded") {
        ControlError::capacity(entity, message)
    } else if lower.contains("is locked") || lower.contains("failed to get \"write\" lock") {
        ControlError::conflict(entity, message)
    } else if lower.contains("shrinking") || lower.contains("invalid") {
        ControlError::validation(entity, message)
    } else {
        ControlError::internal(entity, format!("exit status {}: {}", output.status, message))
    }
}

#[async_trait]
impl StorageBackend for Qcow2Backend {
    fn name(&self) -> &'static str {
        "qcow2"
    }

    /// Internal snapshots write into the image.
    fn requires_quiesce(&self) -> bool {
        true
    }

    fn volume_location(&self, volume_id: &str) -> VolumeLocation {
        VolumeLocation {
            host_id: Some(self.host.host_id().to_string()),
            source: self.volume_path(volume_id),
            format: "qcow2".to_string(),
        }
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn create_volume(&self, volume_id: &str, size_gb: u64) -> Result<()> {
        self.ensure_pool().await?;
        let path = self.volume_path(volume_id);
        let size = format!("{}G", size_gb);
        self.qemu_img(volume_id, &["create", "-f", "qcow2", path.as_str(), size.as_str()])
            .await?;
        info!(path = %path, size_gb, "Volume created");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn resize_volume(&self, volume_id: &str, new_size_gb: u64) -> Result<()> {
        let path = self.volume_path(volume_id);
        let size = format!("{}G", new_size_gb);
        self.qemu_img(volume_id, &["resize", "-f", "qcow2", path.as_str(), size.as_str()])
            .await?;
        info!(path = %path, new_size_gb, "Volume resized");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn create_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<()> {
        let path = self.volume_path(volume_id);
        // Listing first makes a retried snapshot idempotent
        let existing = self.qemu_img(volume_id, &["snapshot", "-l", path.as_str()]).await?;
        if existing.split_whitespace().any(|tag| tag == snapshot_id) {
            debug!(snapshot_id, "Snapshot already present");
            return Ok(());
        }
        self.qemu_img(volume_id, &["snapshot", "-c", snapshot_id, path.as_str()])
            .await?;
        info!(path = %path, snapshot_id, "Snapshot created");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn clone_volume(&self, source_id: &str, dest_id: &str) -> Result<()> {
        let source = self.volume_path(source_id);
        let dest = self.volume_path(dest_id);
        self.qemu_img(source_id, &["convert", "-f", "qcow2", "-O", "qcow2", source.as_str(), dest.as_str()])
            .await?;
        info!(source = %source, dest = %dest, "Volume cloned");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let path = self.volume_path(volume_id);
        self.run(volume_id, "rm", &[path.as_str()]).await?;
        info!(path = %path, "Volume deleted");
        Ok(())
    }
}
