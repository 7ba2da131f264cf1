//! Private data disk and snapshot records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Lifecycle status of a private data disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskStatus {
    Creating,
    Available,
    Resizing,
    SnapshotInProgress,
    Cloning,
    Attached,
    Detaching,
    Deleting,
    Error,
}

impl DiskStatus {
    /// Held only while an operation is running.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            DiskStatus::Creating
                | DiskStatus::Resizing
                | DiskStatus::SnapshotInProgress
                | DiskStatus::Cloning
                | DiskStatus::Detaching
                | DiskStatus::Deleting
        )
    }
}

impl std::fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A tenant-owned block volume, independent of any VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateDataDisk {
    pub id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Size in GB; only ever grows
    pub size_gb: u64,
    pub status: DiskStatus,
    /// Source disk id when this disk was cloned
    pub lineage: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrivateDataDisk {
    pub(crate) fn creating(id: String, request: &CreateDiskRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id: request.tenant_id.clone(),
            name: request.name.clone(),
            description: request.description.clone(),
            size_gb: request.size_gb,
            status: DiskStatus::Creating,
            lineage: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`. Leaving `Error` clears the recorded failure.
    pub fn transition(&mut self, status: DiskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status != DiskStatus::Error {
            self.last_error = None;
        }
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.transition(DiskStatus::Error);
        self.last_error = Some(message.into());
    }
}

/// Request body for creating a disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiskRequest {
    pub tenant_id: String,
    pub size_gb: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CreateDiskRequest {
    pub fn new(tenant_id: impl Into<String>, size_gb: u64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            size_gb,
            name: None,
            description: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(ControlError::validation("disk", "tenantId must not be empty"));
        }
        if self.size_gb == 0 {
            return Err(ControlError::validation("disk", "sizeGb must be greater than 0"));
        }
        Ok(())
    }
}

/// Mutable metadata of a disk (PATCH).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Status of a point-in-time snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    Creating,
    Available,
    Error,
}

/// A snapshot of a disk. Immutable once `Available`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub disk_id: String,
    pub status: SnapshotStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Creation order across all snapshots
    pub sequence: u64,
}

/// Where a disk's volume lives, as seen by the hypervisor attaching it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeLocation {
    /// Storage host the volume lives on, when backed by a remote host
    pub host_id: Option<String>,
    pub source: String,
    pub format: String,
}
