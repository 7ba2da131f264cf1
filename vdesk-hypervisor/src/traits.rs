//! Hypervisor adapter contract.

use async_trait::async_trait;
use serde::Serialize;

use crate::connection::RemoteOutput;
use crate::error::{ControlError, Result};
use crate::types::{DiskAttachSpec, PowerState, VirtualizationType, VmConfig, VmInfo};

/// Limits and features advertised by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCapabilities {
    /// Backend name (e.g., "libvirt/KVM", "vSphere")
    pub name: String,
    /// Maximum vCPUs per VM
    pub max_vcpus: u32,
    /// Maximum memory per VM in GB
    pub max_memory_gb: u32,
    /// Maximum GPUs per VM (0 when GPU assignment is unsupported)
    pub max_gpus: u32,
    /// Disks can be attached to and detached from running VMs
    pub supports_hotplug: bool,
    /// A bootstrap payload can be handed to the guest at creation
    pub supports_bootstrap: bool,
    /// Disk image formats the backend can attach (e.g., "qcow2", "vmdk")
    pub disk_formats: Vec<String>,
}

impl AdapterCapabilities {
    /// Validate a VM configuration against these limits.
    pub fn check(&self, config: &VmConfig) -> Result<()> {
        let entity = config.name.as_str();
        if config.cpu_cores > self.max_vcpus {
            return Err(ControlError::validation(
                entity,
                format!("{} supports at most {} vCPUs, requested {}", self.name, self.max_vcpus, config.cpu_cores),
            ));
        }
        if config.memory_gb > self.max_memory_gb {
            return Err(ControlError::validation(
                entity,
                format!(
                    "{} supports at most {} GB of memory, requested {}",
                    self.name, self.max_memory_gb, config.memory_gb
                ),
            ));
        }
        if config.gpus() > self.max_gpus {
            return Err(ControlError::validation(
                entity,
                format!("{} supports at most {} GPUs, requested {}", self.name, self.max_gpus, config.gpus()),
            ));
        }
        if config.bootstrap.is_some() && !self.supports_bootstrap {
            return Err(ControlError::validation(
                entity,
                format!("{} does not accept a bootstrap payload", self.name),
            ));
        }
        Ok(())
    }

    /// Reject a disk image format the backend cannot attach.
    pub fn check_disk_format(&self, entity: &str, format: &str) -> Result<()> {
        if self.disk_formats.iter().any(|f| f.eq_ignore_ascii_case(format)) {
            return Ok(());
        }
        Err(ControlError::unsupported(
            entity,
            format!(
                "{} cannot attach {} disks (supported: {})",
                self.name,
                format,
                self.disk_formats.join(", ")
            ),
        ))
    }
}

/// Uniform VM lifecycle contract over one compute host.
///
/// Every backend family implements this trait. An adapter is bound to a
/// single host's connection and holds no other state, so managers may create
/// one per operation.
///
/// Lifecycle operations are idempotent: starting a running VM and stopping a
/// stopped VM succeed without side effects. Unknown uuids fail with
/// `NotFound`, illegal transitions with `InvalidState`.
#[async_trait]
pub trait HypervisorAdapter: Send + Sync {
    /// Backend family.
    fn kind(&self) -> VirtualizationType;

    /// Host this adapter is bound to.
    fn host_id(&self) -> &str;

    /// Advertised limits.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Verify reachability and credentials without side effects.
    ///
    /// Returns `false` when the host cannot be reached or rejects the
    /// credentials. Errors only for malformed configuration.
    async fn test_connection(&self) -> Result<bool>;

    /// Allocate and boot a VM. Returns the backend-assigned uuid.
    async fn create_vm(&self, config: &VmConfig) -> Result<VmInfo>;

    async fn start_vm(&self, uuid: &str) -> Result<()>;

    /// Power off a VM. A graceful shutdown is attempted first unless `force`.
    async fn stop_vm(&self, uuid: &str, force: bool) -> Result<()>;

    /// Reboot a running VM.
    async fn restart_vm(&self, uuid: &str) -> Result<()>;

    /// Delete a powered-off VM and its backend storage.
    ///
    /// Fails with `InvalidState` while the VM is running.
    async fn delete_vm(&self, uuid: &str) -> Result<()>;

    async fn get_vm_info(&self, uuid: &str) -> Result<VmInfo>;

    /// Look a VM up by the name it was created with.
    ///
    /// Used to adopt a backend VM whose uuid was never recorded, such as
    /// one whose create call timed out after the backend had acted.
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>>;

    async fn get_vm_status(&self, uuid: &str) -> Result<PowerState> {
        Ok(self.get_vm_info(uuid).await?.power_state)
    }

    /// Attach a block device. Returns the device name or slot used.
    async fn attach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<String>;

    /// Detach a block device previously attached with [`attach_disk`].
    ///
    /// Without `spec.device` the disk is located by its source. A disk that
    /// is not attached fails with `NotFound`.
    ///
    /// [`attach_disk`]: HypervisorAdapter::attach_disk
    async fn detach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<()>;
}

/// Turn the outcome of a reachability check into `test_connection`'s answer.
pub(crate) fn reachability_outcome(
    host_id: &str,
    result: Result<RemoteOutput>,
    ok: impl FnOnce(&RemoteOutput) -> bool,
) -> Result<bool> {
    match result {
        Ok(output) => {
            let reachable = ok(&output);
            if !reachable {
                tracing::debug!(host_id, status = output.status, "Host check failed");
            }
            Ok(reachable)
        }
        Err(e @ ControlError::Configuration { .. }) | Err(e @ ControlError::ValidationFailed { .. }) => Err(e),
        Err(e) => {
            tracing::debug!(host_id, error = %e, kind = %e.kind(), "Host unreachable");
            Ok(false)
        }
    }
}
