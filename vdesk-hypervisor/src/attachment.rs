//! Disk-to-VM attachments.
//!
//! The [`AttachmentManager`] is the only writer of attachment records. A disk
//! has at most one active record (Attaching, Attached, Detaching, or a
//! detach that failed). Detach is soft: the record ends in `Detached` and
//! stays as history.
//!
//! Lock order is disk first, then VM. The VM and storage managers check
//! [`AttachmentIndex`] under their own entity lock, so a VM or disk cannot
//! be deleted while an attach holding that lock is in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::error::{ControlError, Result};
use crate::lifecycle::VmLifecycleManager;
use crate::retry::with_retry;
use crate::storage::{DiskStatus, StorageLifecycleManager};
use crate::store::{RecordTable, INTERRUPTED};
use crate::types::{DiskAttachSpec, VmState};

/// State of an attachment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
    Error,
}

/// The step that failed for a record in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentPhase {
    Attach,
    Detach,
}

/// One disk-to-VM attachment and its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub disk_id: String,
    pub vm_id: String,
    pub state: AttachmentState,
    /// Device name or slot reported by the hypervisor
    pub device: Option<String>,
    pub failed_phase: Option<AttachmentPhase>,
    pub last_error: Option<String>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
}

impl Attachment {
    /// Whether the record still claims the disk.
    pub fn is_active(&self) -> bool {
        match self.state {
            AttachmentState::Attaching | AttachmentState::Attached | AttachmentState::Detaching => true,
            AttachmentState::Error => self.failed_phase == Some(AttachmentPhase::Detach),
            AttachmentState::Detached => false,
        }
    }

    fn transition(&mut self, state: AttachmentState) {
        self.state = state;
        self.updated_at = Utc::now();
        if state != AttachmentState::Error {
            self.failed_phase = None;
            self.last_error = None;
        }
        if state == AttachmentState::Detached {
            self.detached_at = Some(self.updated_at);
        }
    }

    fn fail(&mut self, phase: AttachmentPhase, message: String) {
        self.transition(AttachmentState::Error);
        self.failed_phase = Some(phase);
        self.last_error = Some(message);
    }
}

/// Read access to active attachments, for managers guarding deletes.
pub trait AttachmentIndex: Send + Sync {
    fn active_for_disk(&self, disk_id: &str) -> Vec<Attachment>;
    fn active_for_vm(&self, vm_id: &str) -> Vec<Attachment>;
}

/// An index with no attachments, for callers that have no attachment manager.
pub struct NoAttachments;

impl AttachmentIndex for NoAttachments {
    fn active_for_disk(&self, _disk_id: &str) -> Vec<Attachment> {
        Vec::new()
    }

    fn active_for_vm(&self, _vm_id: &str) -> Vec<Attachment> {
        Vec::new()
    }
}

/// Attachment policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// Allow attaching to a stopped VM (cold attach)
    pub allow_stopped: bool,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self { allow_stopped: true }
    }
}

/// Maintains the disk-to-VM relation.
pub struct AttachmentManager {
    vms: Arc<VmLifecycleManager>,
    storage: Arc<StorageLifecycleManager>,
    records: RecordTable<Attachment>,
    config: AttachmentConfig,
    sequence: AtomicU64,
}

impl AttachmentManager {
    pub fn new(
        vms: Arc<VmLifecycleManager>,
        storage: Arc<StorageLifecycleManager>,
        records: RecordTable<Attachment>,
        config: AttachmentConfig,
    ) -> Self {
        settle_interrupted(&records, &storage);
        let last_sequence = records.list().iter().map(|a| a.sequence).max().unwrap_or(0);
        Self {
            vms,
            storage,
            records,
            config,
            sequence: AtomicU64::new(last_sequence),
        }
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Attachment)) -> Result<Attachment> {
        self.records.update(id, f)
    }

    /// Attach an available disk to a VM.
    #[instrument(skip(self))]
    pub async fn attach(&self, disk_id: &str, vm_id: &str, device: Option<String>) -> Result<Attachment> {
        let disk_guard = self.storage.lock_disk(disk_id).await;
        let vm_guard = self.vms.lock_vm(vm_id).await;

        let disk = self.storage.get_disk(disk_id)?;
        let (vm, adapter) = self.vms.attach_target(&vm_guard)?;

        if let Some(active) = self.active_for_disk(disk_id).first() {
            return Err(ControlError::conflict(
                disk_id,
                format!("disk is already attached to {}", active.vm_id),
            ));
        }
        if disk.status != DiskStatus::Available {
            return Err(ControlError::invalid_state(
                disk_id,
                format!("cannot attach a disk that is {}", disk.status),
            ));
        }
        match vm.state {
            VmState::Running => {
                if !adapter.capabilities().supports_hotplug {
                    return Err(ControlError::unsupported(
                        vm_id,
                        format!("{} does not support hot-attaching disks", adapter.capabilities().name),
                    ));
                }
            }
            VmState::Stopped if self.config.allow_stopped => {}
            other => {
                return Err(ControlError::invalid_state(
                    vm_id,
                    format!("cannot attach a disk to a VM that is {}", other),
                ));
            }
        }
        let uuid = vm
            .uuid
            .clone()
            .ok_or_else(|| ControlError::invalid_state(vm_id, "VM has no backend instance"))?;

        let location = self.storage.volume_location(disk_id);
        adapter.capabilities().check_disk_format(disk_id, &location.format)?;

        let now = Utc::now();
        let record = Attachment {
            id: format!("att-{}", uuid::Uuid::new_v4()),
            disk_id: disk_id.to_string(),
            vm_id: vm_id.to_string(),
            state: AttachmentState::Attaching,
            device: device.clone(),
            failed_phase: None,
            last_error: None,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            created_at: now,
            updated_at: now,
            detached_at: None,
        };
        self.records.insert(&record.id, record.clone())?;

        let spec = DiskAttachSpec {
            disk_id: disk_id.to_string(),
            source: location.source,
            format: location.format,
            device,
        };

        let adapter_ref = adapter.as_ref();
        let (uuid_ref, spec_ref) = (uuid.as_str(), &spec);
        let result = with_retry(self.vms.retry_policy(), "attach_disk", disk_id, || adapter_ref.attach_disk(uuid_ref, spec_ref)).await;

        match result {
            Ok(device) => {
                self.storage.set_status_locked(&disk_guard, DiskStatus::Attached, None)?;
                info!(disk_id = %disk_id, vm_id = %vm_id, device = %device, "Disk attached");
                self.update(&record.id, |a| {
                    a.device = Some(device);
                    a.transition(AttachmentState::Attached);
                })
            }
            Err(e) => {
                let err = e.with_entity(disk_id);
                error!(disk_id = %disk_id, vm_id = %vm_id, error = %err, "Attach failed");
                let message = err.to_string();
                self.update(&record.id, |a| a.fail(AttachmentPhase::Attach, message))?;
                Err(err)
            }
        }
    }

    /// Detach a disk from the VM it is attached to.
    #[instrument(skip(self))]
    pub async fn detach(&self, disk_id: &str, vm_id: &str) -> Result<Attachment> {
        let disk_guard = self.storage.lock_disk(disk_id).await;
        let vm_guard = self.vms.lock_vm(vm_id).await;

        let active = self
            .active_for_disk(disk_id)
            .into_iter()
            .next()
            .ok_or_else(|| ControlError::invalid_state(disk_id, "disk is not attached"))?;
        if active.vm_id != vm_id {
            return Err(ControlError::conflict(
                disk_id,
                format!("disk is attached to {}, not {}", active.vm_id, vm_id),
            ));
        }
        if active.state != AttachmentState::Attached {
            return Err(ControlError::invalid_state(
                disk_id,
                format!("attachment {} is {:?}", active.id, active.state),
            ));
        }

        let (vm, adapter) = self.vms.attach_target(&vm_guard)?;
        if vm.state == VmState::Running && !adapter.capabilities().supports_hotplug {
            return Err(ControlError::unsupported(
                vm_id,
                format!("{} does not support hot-detaching disks", adapter.capabilities().name),
            ));
        }
        let uuid = vm
            .uuid
            .clone()
            .ok_or_else(|| ControlError::invalid_state(vm_id, "VM has no backend instance"))?;

        self.update(&active.id, |a| a.transition(AttachmentState::Detaching))?;
        self.storage.set_status_locked(&disk_guard, DiskStatus::Detaching, None)?;

        let spec = self.detach_spec(&active);
        let adapter_ref = adapter.as_ref();
        let (uuid_ref, spec_ref) = (uuid.as_str(), &spec);
        let result = with_retry(self.vms.retry_policy(), "detach_disk", disk_id, || adapter_ref.detach_disk(uuid_ref, spec_ref)).await;

        match result {
            Ok(()) => {
                self.storage.set_status_locked(&disk_guard, DiskStatus::Available, None)?;
                info!(disk_id = %disk_id, vm_id = %vm_id, "Disk detached");
                self.update(&active.id, |a| a.transition(AttachmentState::Detached))
            }
            Err(e) => {
                let err = e.with_entity(disk_id);
                error!(disk_id = %disk_id, vm_id = %vm_id, error = %err, "Detach failed");
                let message = err.to_string();
                self.storage
                    .set_status_locked(&disk_guard, DiskStatus::Error, Some(message.clone()))?;
                self.update(&active.id, |a| a.fail(AttachmentPhase::Detach, message))?;
                Err(err)
            }
        }
    }

    /// Finish a detach that failed earlier.
    ///
    /// Re-issues the detach primitive; a backend `NotFound` counts as already
    /// detached. On success the record is `Detached` and the disk `Available`.
    #[instrument(skip(self))]
    pub async fn recover_detach(&self, disk_id: &str, vm_id: &str) -> Result<Attachment> {
        let disk_guard = self.storage.lock_disk(disk_id).await;
        let vm_guard = self.vms.lock_vm(vm_id).await;

        let record = self
            .records
            .filter(|a| {
                a.disk_id == disk_id
                    && a.vm_id == vm_id
                    && a.state == AttachmentState::Error
                    && a.failed_phase == Some(AttachmentPhase::Detach)
            })
            .into_iter()
            .next()
            .ok_or_else(|| ControlError::invalid_state(disk_id, format!("no failed detach from {}", vm_id)))?;

        let spec = self.detach_spec(&record);
        let result = match self.vms.attach_target(&vm_guard) {
            Ok((vm, adapter)) => match vm.uuid.as_deref() {
                Some(uuid) if vm.state != VmState::Deleted => {
                    let adapter_ref = adapter.as_ref();
                    let spec_ref = &spec;
                    with_retry(self.vms.retry_policy(), "detach_disk", disk_id, || adapter_ref.detach_disk(uuid, spec_ref)).await
                }
                _ => Ok(()),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) | Err(ControlError::NotFound { .. }) => {
                self.storage.set_status_locked(&disk_guard, DiskStatus::Available, None)?;
                warn!(disk_id = %disk_id, vm_id = %vm_id, attachment_id = %record.id, "Failed detach recovered");
                self.update(&record.id, |a| a.transition(AttachmentState::Detached))
            }
            Err(e) => {
                let err = e.with_entity(disk_id);
                let message = err.to_string();
                self.update(&record.id, |a| a.last_error = Some(message))?;
                Err(err)
            }
        }
    }

    fn detach_spec(&self, record: &Attachment) -> DiskAttachSpec {
        let location = self.storage.volume_location(&record.disk_id);
        DiskAttachSpec {
            disk_id: record.disk_id.clone(),
            source: location.source,
            format: location.format,
            device: record.device.clone(),
        }
    }

    /// All records for a disk, including detached history, oldest first.
    pub fn list_attachments(&self, disk_id: &str) -> Result<Vec<Attachment>> {
        self.storage.get_disk(disk_id)?;
        let mut records = self.records.filter(|a| a.disk_id == disk_id);
        records.sort_by_key(|a| (a.created_at, a.sequence));
        Ok(records)
    }

    /// Records for a VM, oldest first.
    pub fn list_vm_attachments(&self, vm_id: &str) -> Vec<Attachment> {
        let mut records = self.records.filter(|a| a.vm_id == vm_id);
        records.sort_by_key(|a| (a.created_at, a.sequence));
        records
    }
}

/// Turn records left `Attaching` or `Detaching` by a previous process into
/// failed detaches.
///
/// Whether the hypervisor acted is unknown, so the disk stays claimed and is
/// marked `Error` until `recover_detach` confirms it is free.
fn settle_interrupted(records: &RecordTable<Attachment>, storage: &StorageLifecycleManager) {
    let interrupted = records.filter(|a| {
        matches!(a.state, AttachmentState::Attaching | AttachmentState::Detaching)
    });
    for record in interrupted {
        warn!(
            attachment_id = %record.id,
            disk_id = %record.disk_id,
            vm_id = %record.vm_id,
            state = ?record.state,
            "Attachment interrupted by restart"
        );
        if let Err(e) = records.update(&record.id, |a| a.fail(AttachmentPhase::Detach, INTERRUPTED.to_string())) {
            warn!(attachment_id = %record.id, error = %e, "Failed to settle interrupted attachment");
            continue;
        }
        if let Err(e) = storage.mark_interrupted(&record.disk_id) {
            warn!(disk_id = %record.disk_id, error = %e, "Failed to mark disk of interrupted attachment");
        }
    }
}

impl AttachmentIndex for AttachmentManager {
    fn active_for_disk(&self, disk_id: &str) -> Vec<Attachment> {
        self.records.filter(|a| a.disk_id == disk_id && a.is_active())
    }

    fn active_for_vm(&self, vm_id: &str) -> Vec<Attachment> {
        self.records.filter(|a| a.vm_id == vm_id && a.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{
        ConnectionRegistry, Credential, CredentialStore, RegistryConfig, ScriptedExecutor,
    };
    use crate::lifecycle::LifecycleConfig;
    use crate::mock::{MockFactory, MockOp};
    use crate::retry::RetryPolicy;
    use crate::storage::{CreateDiskRequest, MockStorageBackend};
    use crate::traits::{AdapterCapabilities, HypervisorAdapter};
    use crate::types::{ConnectionDescriptor, HostRegistration, TransportKind, VmConfig};

    struct Fixture {
        vms: Arc<VmLifecycleManager>,
        storage: Arc<StorageLifecycleManager>,
        attachments: AttachmentManager,
        factory: Arc<MockFactory>,
    }

    fn fixture(config: AttachmentConfig) -> Fixture {
        let credentials = Arc::new(CredentialStore::new());
        credentials.insert("root", Credential::key("root", "/etc/vdesk/id_ed25519"));
        let registry = Arc::new(ConnectionRegistry::new(
            RecordTable::in_memory("hosts"),
            credentials,
            Arc::new(ScriptedExecutor::new()),
            RegistryConfig::default(),
        ));
        registry
            .register_host(HostRegistration {
                id: Some("host-1".into()),
                virtualization_type: "kvm".into(),
                connection: ConnectionDescriptor::new("10.0.0.5", 22, "root", TransportKind::Ssh),
            })
            .unwrap();

        let factory = Arc::new(MockFactory::new());
        let lifecycle = LifecycleConfig {
            retry: RetryPolicy::immediate(2),
            provisioning_poll_attempts: 2,
            provisioning_poll_interval_ms: 1,
        };
        let vms = Arc::new(VmLifecycleManager::new(
            registry,
            factory.clone(),
            RecordTable::in_memory("vms"),
            lifecycle,
        ));
        let storage = Arc::new(StorageLifecycleManager::new(
            Arc::new(MockStorageBackend::new()),
            RecordTable::in_memory("disks"),
            RecordTable::in_memory("snapshots"),
            RetryPolicy::immediate(2),
        ));
        let attachments = AttachmentManager::new(vms.clone(), storage.clone(), RecordTable::in_memory("attachments"), config);
        Fixture { vms, storage, attachments, factory }
    }

    #[tokio::test]
    async fn test_attach_then_detach_leaves_history() {
        let f = fixture(AttachmentConfig::default());
        let vm = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();

        let attached = f.attachments.attach(&disk.id, &vm.id, None).await.unwrap();
        assert_eq!(attached.state, AttachmentState::Attached);
        assert_eq!(attached.device.as_deref(), Some("vdb"));
        assert_eq!(f.storage.get_disk(&disk.id).unwrap().status, DiskStatus::Attached);

        f.attachments.detach(&disk.id, &vm.id).await.unwrap();
        assert_eq!(f.storage.get_disk(&disk.id).unwrap().status, DiskStatus::Available);

        let history = f.attachments.list_attachments(&disk.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, AttachmentState::Detached);
        assert!(history[0].detached_at.is_some());
        assert!(f.attachments.active_for_vm(&vm.id).is_empty());
    }

    #[tokio::test]
    async fn test_second_attach_conflicts() {
        let f = fixture(AttachmentConfig::default());
        let v1 = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let v2 = f.vms.create_vm("host-1", VmConfig::new("desk-02")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();

        f.attachments.attach(&disk.id, &v1.id, None).await.unwrap();
        assert!(matches!(
            f.attachments.attach(&disk.id, &v2.id, None).await,
            Err(ControlError::Conflict { .. })
        ));
        assert!(matches!(
            f.attachments.detach(&disk.id, &v2.id).await,
            Err(ControlError::Conflict { .. })
        ));
        assert_eq!(f.attachments.active_for_disk(&disk.id).len(), 1);
    }

    #[tokio::test]
    async fn test_detach_unattached_is_invalid_state() {
        let f = fixture(AttachmentConfig::default());
        let vm = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
        assert!(matches!(
            f.attachments.detach(&disk.id, &vm.id).await,
            Err(ControlError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_hot_attach_requires_hotplug() {
        let f = fixture(AttachmentConfig::default());
        let vm = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
        f.factory.adapter("host-1").set_capabilities(AdapterCapabilities {
            name: "mock/no-hotplug".into(),
            max_vcpus: 64,
            max_memory_gb: 512,
            max_gpus: 0,
            supports_hotplug: false,
            supports_bootstrap: false,
            disk_formats: vec!["qcow2".into()],
        });

        assert!(matches!(
            f.attachments.attach(&disk.id, &vm.id, None).await,
            Err(ControlError::UnsupportedOperation { .. })
        ));

        // Cold attach still works
        f.vms.stop_vm(&vm.id, false).await.unwrap();
        f.attachments.attach(&disk.id, &vm.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_rejects_foreign_disk_format() {
        let f = fixture(AttachmentConfig::default());
        let vm = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
        let adapter = f.factory.adapter("host-1");
        let mut caps = adapter.capabilities();
        caps.disk_formats = vec!["vmdk".into()];
        adapter.set_capabilities(caps);

        // qcow2 volume on a vmdk-only backend
        let err = f.attachments.attach(&disk.id, &vm.id, None).await.unwrap_err();
        assert!(matches!(err, ControlError::UnsupportedOperation { .. }));
        assert_eq!(adapter.calls(MockOp::Attach), 0);
        assert!(f.attachments.list_attachments(&disk.id).unwrap().is_empty());
        assert_eq!(f.storage.get_disk(&disk.id).unwrap().status, DiskStatus::Available);
    }

    #[tokio::test]
    async fn test_stopped_policy() {
        let f = fixture(AttachmentConfig { allow_stopped: false });
        let vm = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
        f.vms.stop_vm(&vm.id, false).await.unwrap();

        assert!(matches!(
            f.attachments.attach(&disk.id, &vm.id, None).await,
            Err(ControlError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_attach_keeps_disk_available() {
        let f = fixture(AttachmentConfig::default());
        let vm = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
        f.factory
            .adapter("host-1")
            .fail_next(MockOp::Attach, ControlError::capacity("host-1", "no free PCI slots"));

        assert!(f.attachments.attach(&disk.id, &vm.id, None).await.is_err());
        assert_eq!(f.storage.get_disk(&disk.id).unwrap().status, DiskStatus::Available);

        let history = f.attachments.list_attachments(&disk.id).unwrap();
        assert_eq!(history[0].state, AttachmentState::Error);
        assert_eq!(history[0].failed_phase, Some(AttachmentPhase::Attach));

        // The failed record does not block a new attempt
        f.attachments.attach(&disk.id, &vm.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_detach_then_recover() {
        let f = fixture(AttachmentConfig::default());
        let vm = f.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = f.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
        f.attachments.attach(&disk.id, &vm.id, None).await.unwrap();

        f.factory
            .adapter("host-1")
            .fail_next(MockOp::Detach, ControlError::internal("host-1", "device busy"));
        assert!(f.attachments.detach(&disk.id, &vm.id).await.is_err());
        assert_eq!(f.storage.get_disk(&disk.id).unwrap().status, DiskStatus::Error);
        assert_eq!(f.attachments.active_for_disk(&disk.id).len(), 1);

        // Still claimed, so neither side can be deleted
        assert!(matches!(
            f.storage.delete_disk(&disk.id, &f.attachments).await,
            Err(ControlError::Conflict { .. })
        ));
        assert!(matches!(
            f.vms.delete_vm(&vm.id, &f.attachments).await,
            Err(ControlError::Conflict { .. })
        ));

        let recovered = f.attachments.recover_detach(&disk.id, &vm.id).await.unwrap();
        assert_eq!(recovered.state, AttachmentState::Detached);
        assert_eq!(f.storage.get_disk(&disk.id).unwrap().status, DiskStatus::Available);
        f.storage.delete_disk(&disk.id, &f.attachments).await.unwrap();
    }
}
