//! End-to-end scenarios across the registry, adapters and the three managers.
//!
//! These tests run against mock adapters and mock storage, except where a
//! scenario needs the real adapter path through the connection registry.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vdesk_hypervisor::{
    AdapterCapabilities, AdapterFactory, AttachmentConfig, AttachmentIndex, AttachmentManager, AttachmentPhase, AttachmentState,
    ComputeHost, ConnectionDescriptor, ConnectionRegistry, ControlError, CreateDiskRequest,
    Credential, CredentialStore, DiskAttachSpec, DiskStatus, HostRegistration, HypervisorAdapter,
    HypervisorFactory, LifecycleConfig, MockAdapter, MockFactory, MockOp, MockStorageBackend, PowerState,
    Reachability, RecordTable, RegistryConfig, RemoteOutput, RetryPolicy, ScriptedExecutor, StorageLifecycleManager,
    TransportKind, VirtualizationType, VmConfig, VmInfo, VmLifecycleManager, VmState,
};

struct ControlPlane {
    registry: Arc<ConnectionRegistry>,
    vms: Arc<VmLifecycleManager>,
    storage: Arc<StorageLifecycleManager>,
    attachments: AttachmentManager,
}

fn registry(executor: Arc<ScriptedExecutor>, config: RegistryConfig) -> Arc<ConnectionRegistry> {
    let credentials = Arc::new(CredentialStore::new());
    credentials.insert("root", Credential::key("root", "/etc/vdesk/id_ed25519"));
    let registry = Arc::new(ConnectionRegistry::new(
        RecordTable::in_memory("hosts"),
        credentials,
        executor,
        config,
    ));
    registry
        .register_host(HostRegistration {
            id: Some("host-1".into()),
            virtualization_type: "kvm".into(),
            connection: ConnectionDescriptor::new("10.0.0.5", 22, "root", TransportKind::Ssh),
        })
        .unwrap();
    registry
}

fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        retry: RetryPolicy::immediate(3),
        provisioning_poll_attempts: 3,
        provisioning_poll_interval_ms: 1,
    }
}

fn control_plane(factory: Arc<dyn AdapterFactory>, state_dir: Option<&Path>) -> ControlPlane {
    let registry = registry(Arc::new(ScriptedExecutor::new()), RegistryConfig::default());
    let (vm_table, disk_table, snapshot_table, attachment_table) = match state_dir {
        Some(dir) => (
            RecordTable::persistent("vms", dir).unwrap(),
            RecordTable::persistent("disks", dir).unwrap(),
            RecordTable::persistent("snapshots", dir).unwrap(),
            RecordTable::persistent("attachments", dir).unwrap(),
        ),
        None => (
            RecordTable::in_memory("vms"),
            RecordTable::in_memory("disks"),
            RecordTable::in_memory("snapshots"),
            RecordTable::in_memory("attachments"),
        ),
    };

    let vms = Arc::new(VmLifecycleManager::new(registry.clone(), factory, vm_table, lifecycle_config()));
    let storage = Arc::new(StorageLifecycleManager::new(
        Arc::new(MockStorageBackend::new()),
        disk_table,
        snapshot_table,
        RetryPolicy::immediate(3),
    ));
    let attachments = AttachmentManager::new(vms.clone(), storage.clone(), attachment_table, AttachmentConfig::default());
    ControlPlane { registry, vms, storage, attachments }
}

#[tokio::test]
async fn test_private_data_disk_scenario() {
    let cp = control_plane(Arc::new(MockFactory::new()), None);
    let v1 = cp.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
    let v2 = cp.vms.create_vm("host-1", VmConfig::new("desk-02")).await.unwrap();

    let disk = cp.storage.create_disk(CreateDiskRequest::new("tenant-a", 50)).await.unwrap();
    assert_eq!(disk.size_gb, 50);

    let disk = cp.storage.resize_disk(&disk.id, 80).await.unwrap();
    assert_eq!(disk.size_gb, 80);
    assert!(matches!(
        cp.storage.resize_disk(&disk.id, 50).await,
        Err(ControlError::ValidationFailed { .. })
    ));

    cp.attachments.attach(&disk.id, &v1.id, None).await.unwrap();
    assert_eq!(cp.storage.get_disk(&disk.id).unwrap().status, DiskStatus::Attached);
    assert!(matches!(
        cp.attachments.attach(&disk.id, &v2.id, None).await,
        Err(ControlError::Conflict { .. })
    ));

    // Attached disks cannot be resized
    assert!(matches!(
        cp.storage.resize_disk(&disk.id, 100).await,
        Err(ControlError::InvalidState { .. })
    ));

    cp.attachments.detach(&disk.id, &v1.id).await.unwrap();
    let history = cp.attachments.list_attachments(&disk.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, AttachmentState::Detached);

    cp.storage.delete_disk(&disk.id, &cp.attachments).await.unwrap();
    assert!(matches!(cp.storage.get_disk(&disk.id), Err(ControlError::NotFound { .. })));
}

#[tokio::test]
async fn test_create_on_unreachable_host_ends_in_error() {
    let factory = Arc::new(MockFactory::new());
    let adapter = factory.adapter("host-1");
    adapter.set_unreachable(true);
    let cp = control_plane(factory.clone(), None);

    let err = cp.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap_err();
    assert!(matches!(err, ControlError::BackendUnavailable { .. }));
    assert_eq!(adapter.calls(MockOp::Create), 3);

    let vm = cp.vms.get_vm(err.entity()).unwrap();
    assert_eq!(vm.state, VmState::Error);
    assert!(vm.last_error.unwrap().contains("unreachable"));

    let host = cp.vms.test_host("host-1").await.unwrap();
    assert_eq!(host.reachability, Reachability::Unreachable);
}

#[tokio::test]
async fn test_deadline_surfaces_timeout_through_real_adapter() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.set_delay(Some(Duration::from_millis(200)));
    let registry = registry(
        executor.clone(),
        RegistryConfig {
            call_timeout: Duration::from_millis(20),
            default_concurrency: 2,
        },
    );
    let vms = VmLifecycleManager::new(
        registry.clone(),
        Arc::new(HypervisorFactory::new(registry.clone())),
        RecordTable::in_memory("vms"),
        LifecycleConfig {
            retry: RetryPolicy::immediate(2),
            ..lifecycle_config()
        },
    );

    let err = vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap_err();
    assert!(matches!(err, ControlError::Timeout { .. }));
    assert_eq!(vms.get_vm(err.entity()).unwrap().state, VmState::Error);

    // The detached calls still reach the host
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executor.count("domuuid desk-01"), 2);

    // The domain defined by the timed-out call is adopted by name
    executor.set_delay(None);
    executor.respond("domuuid desk-01", RemoteOutput::ok("6f1c2b1e-0000-4000-8000-000000000001\n"));
    executor.respond(
        "dominfo",
        RemoteOutput::ok("Name:           desk-01\nUUID:           6f1c2b1e-0000-4000-8000-000000000001\nState:          running\n"),
    );
    executor.respond("domstate", RemoteOutput::ok("running\n"));

    let vm = vms.get_vm_status(err.entity()).await.unwrap();
    assert_eq!(vm.uuid.as_deref(), Some("6f1c2b1e-0000-4000-8000-000000000001"));
    assert_eq!(vm.state, VmState::Running);
}

#[tokio::test]
async fn test_delete_destroys_vm_left_by_timed_out_create() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.set_delay(Some(Duration::from_millis(100)));
    let registry = registry(
        executor.clone(),
        RegistryConfig {
            call_timeout: Duration::from_millis(20),
            default_concurrency: 2,
        },
    );
    let vms = Arc::new(VmLifecycleManager::new(
        registry.clone(),
        Arc::new(HypervisorFactory::new(registry.clone())),
        RecordTable::in_memory("vms"),
        LifecycleConfig {
            retry: RetryPolicy::immediate(1),
            ..lifecycle_config()
        },
    ));
    let err = vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap_err();
    assert!(matches!(err, ControlError::Timeout { .. }));
    let vm_id = err.entity().to_string();
    assert!(vms.get_vm(&vm_id).unwrap().uuid.is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    executor.set_delay(None);
    executor.respond("domuuid desk-01", RemoteOutput::ok("6f1c2b1e-0000-4000-8000-000000000001\n"));
    executor.respond("domstate", RemoteOutput::ok("shut off\n"));

    let attachments = AttachmentManager::new(
        vms.clone(),
        Arc::new(StorageLifecycleManager::new(
            Arc::new(MockStorageBackend::new()),
            RecordTable::in_memory("disks"),
            RecordTable::in_memory("snapshots"),
            RetryPolicy::immediate(1),
        )),
        RecordTable::in_memory("attachments"),
        AttachmentConfig::default(),
    );
    let deleted = vms.delete_vm(&vm_id, &attachments).await.unwrap();
    assert_eq!(deleted.state, VmState::Deleted);
    assert_eq!(executor.count("undefine 6f1c2b1e-0000-4000-8000-000000000001"), 1);
}

/// Adapter wrapper that tracks how many calls run at once.
struct ConcurrencyTracker {
    inner: Arc<MockAdapter>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyTracker {
    async fn track<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let out = fut.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl HypervisorAdapter for ConcurrencyTracker {
    fn kind(&self) -> VirtualizationType {
        self.inner.kind()
    }
    fn host_id(&self) -> &str {
        self.inner.host_id()
    }
    fn capabilities(&self) -> AdapterCapabilities {
        self.inner.capabilities()
    }
    async fn test_connection(&self) -> vdesk_hypervisor::Result<bool> {
        self.inner.test_connection().await
    }
    async fn create_vm(&self, config: &VmConfig) -> vdesk_hypervisor::Result<VmInfo> {
        self.inner.create_vm(config).await
    }
    async fn start_vm(&self, uuid: &str) -> vdesk_hypervisor::Result<()> {
        self.track(self.inner.start_vm(uuid)).await
    }
    async fn stop_vm(&self, uuid: &str, force: bool) -> vdesk_hypervisor::Result<()> {
        self.track(self.inner.stop_vm(uuid, force)).await
    }
    async fn restart_vm(&self, uuid: &str) -> vdesk_hypervisor::Result<()> {
        self.track(self.inner.restart_vm(uuid)).await
    }
    async fn delete_vm(&self, uuid: &str) -> vdesk_hypervisor::Result<()> {
        self.inner.delete_vm(uuid).await
    }
    async fn get_vm_info(&self, uuid: &str) -> vdesk_hypervisor::Result<VmInfo> {
        self.inner.get_vm_info(uuid).await
    }
    async fn find_vm(&self, name: &str) -> vdesk_hypervisor::Result<Option<VmInfo>> {
        self.inner.find_vm(name).await
    }
    async fn get_vm_status(&self, uuid: &str) -> vdesk_hypervisor::Result<PowerState> {
        self.inner.get_vm_status(uuid).await
    }
    async fn attach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> vdesk_hypervisor::Result<String> {
        self.inner.attach_disk(uuid, spec).await
    }
    async fn detach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> vdesk_hypervisor::Result<()> {
        self.inner.detach_disk(uuid, spec).await
    }
}

struct TrackingFactory(Arc<ConcurrencyTracker>);

impl AdapterFactory for TrackingFactory {
    fn adapter_for(&self, _host: &ComputeHost) -> vdesk_hypervisor::Result<Arc<dyn HypervisorAdapter>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_concurrent_power_operations_are_serialized() {
    let mock = Arc::new(MockAdapter::new("host-1", VirtualizationType::Kvm));
    mock.set_latency(Some(Duration::from_millis(5)));
    let tracker = Arc::new(ConcurrencyTracker {
        inner: mock.clone(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let cp = control_plane(Arc::new(TrackingFactory(tracker.clone())), None);
    let vm = cp.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..12 {
        let vms = cp.vms.clone();
        let id = vm.id.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                vms.stop_vm(&id, false).await
            } else {
                vms.start_vm(&id).await
            }
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    let uuid = vm.uuid.unwrap();
    let backend = mock.get_vm_status(&uuid).await.unwrap();
    assert_eq!(Some(cp.vms.get_vm(&vm.id).unwrap().state), VmState::from_power(backend));
}

#[tokio::test]
async fn test_delete_requires_detached_disks() {
    let cp = control_plane(Arc::new(MockFactory::new()), None);
    let vm = cp.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
    let disk = cp.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
    cp.attachments.attach(&disk.id, &vm.id, None).await.unwrap();

    assert!(matches!(
        cp.vms.delete_vm(&vm.id, &cp.attachments).await,
        Err(ControlError::Conflict { .. })
    ));
    assert!(matches!(
        cp.storage.delete_disk(&disk.id, &cp.attachments).await,
        Err(ControlError::Conflict { .. })
    ));

    cp.attachments.detach(&disk.id, &vm.id).await.unwrap();
    let deleted = cp.vms.delete_vm(&vm.id, &cp.attachments).await.unwrap();
    assert_eq!(deleted.state, VmState::Deleted);
    cp.vms.remove_host("host-1").unwrap();
    assert!(cp.registry.list_hosts().is_empty());
}

#[tokio::test]
async fn test_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::new());

    let (vm_id, disk_id) = {
        let cp = control_plane(factory.clone(), Some(dir.path()));
        let vm = cp.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = cp.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
        cp.attachments.attach(&disk.id, &vm.id, None).await.unwrap();
        (vm.id, disk.id)
    };

    let cp = control_plane(factory, Some(dir.path()));
    assert_eq!(cp.vms.get_vm(&vm_id).unwrap().state, VmState::Running);
    assert_eq!(cp.storage.get_disk(&disk_id).unwrap().status, DiskStatus::Attached);
    assert_eq!(cp.attachments.list_attachments(&disk_id).unwrap().len(), 1);

    cp.attachments.detach(&disk_id, &vm_id).await.unwrap();
}

#[tokio::test]
async fn test_restart_settles_records_left_mid_operation() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::new());
    let mock = factory.adapter("host-1");

    let (vm_id, disk_id) = {
        let cp = control_plane(factory.clone(), Some(dir.path()));
        let vm = cp.vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
        let disk = cp.storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();

        // Cut both calls off while the adapter is still working
        mock.set_latency(Some(Duration::from_millis(500)));
        let attach = tokio::time::timeout(Duration::from_millis(30), cp.attachments.attach(&disk.id, &vm.id, None));
        assert!(attach.await.is_err());
        let restart = tokio::time::timeout(Duration::from_millis(30), cp.vms.restart_vm(&vm.id));
        assert!(restart.await.is_err());
        mock.set_latency(None);

        assert_eq!(cp.vms.get_vm(&vm.id).unwrap().state, VmState::Restarting);
        assert_eq!(cp.attachments.list_attachments(&disk.id).unwrap()[0].state, AttachmentState::Attaching);
        (vm.id, disk.id)
    };

    let cp = control_plane(factory, Some(dir.path()));
    let vm = cp.vms.get_vm(&vm_id).unwrap();
    assert_eq!(vm.state, VmState::Error);
    assert!(vm.last_error.unwrap().contains("interrupted"));

    let record = cp.attachments.list_attachments(&disk_id).unwrap().remove(0);
    assert_eq!(record.state, AttachmentState::Error);
    assert_eq!(record.failed_phase, Some(AttachmentPhase::Detach));
    assert!(record.is_active());
    assert_eq!(cp.storage.get_disk(&disk_id).unwrap().status, DiskStatus::Error);

    // Both records can be driven out of Error
    assert_eq!(cp.vms.get_vm_status(&vm_id).await.unwrap().state, VmState::Running);
    cp.attachments.recover_detach(&disk_id, &vm_id).await.unwrap();
    assert_eq!(cp.storage.get_disk(&disk_id).unwrap().status, DiskStatus::Available);
    cp.attachments.attach(&disk_id, &vm_id, None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_attach_and_detach_keep_one_active_record() {
    let factory = Arc::new(MockFactory::new());
    let ControlPlane { vms, storage, attachments, .. } = control_plane(factory.clone(), None);
    let attachments = Arc::new(attachments);
    let v1 = vms.create_vm("host-1", VmConfig::new("desk-01")).await.unwrap();
    let v2 = vms.create_vm("host-1", VmConfig::new("desk-02")).await.unwrap();
    let disk = storage.create_disk(CreateDiskRequest::new("tenant-a", 10)).await.unwrap();
    let mock = factory.adapter("host-1");
    mock.set_latency(Some(Duration::from_millis(5)));

    // Samples the record count for the whole run
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let (attachments, done, disk_id) = (attachments.clone(), done.clone(), disk.id.clone());
        tokio::spawn(async move {
            let mut peak = 0;
            while !done.load(Ordering::SeqCst) {
                peak = peak.max(attachments.active_for_disk(&disk_id).len());
                tokio::task::yield_now().await;
            }
            peak
        })
    };

    for _ in 0..8 {
        let calls = [(true, &v1.id), (true, &v2.id), (false, &v1.id)];
        let tasks: Vec<_> = calls
            .into_iter()
            .map(|(attach, vm_id)| {
                let (attachments, disk_id, vm_id) = (attachments.clone(), disk.id.clone(), vm_id.clone());
                tokio::spawn(async move {
                    let result = if attach {
                        attachments.attach(&disk_id, &vm_id, None).await.map(|_| ())
                    } else {
                        attachments.detach(&disk_id, &vm_id).await.map(|_| ())
                    };
                    (result, attachments.active_for_disk(&disk_id).len())
                })
            })
            .collect();

        let results = tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(tasks))
            .await
            .expect("attach and detach must not deadlock");
        for joined in results {
            let (result, active) = joined.unwrap();
            assert!(active <= 1);
            if let Err(e) = result {
                assert!(
                    matches!(e, ControlError::Conflict { .. } | ControlError::InvalidState { .. }),
                    "unexpected error: {}",
                    e
                );
            }
        }

        let attached = mock.attached_devices(v1.uuid.as_deref().unwrap()).len()
            + mock.attached_devices(v2.uuid.as_deref().unwrap()).len();
        assert_eq!(attached, attachments.active_for_disk(&disk.id).len());

        if let Some(active) = attachments.active_for_disk(&disk.id).first() {
            attachments.detach(&disk.id, &active.vm_id).await.unwrap();
        }
    }

    done.store(true, Ordering::SeqCst);
    assert!(sampler.await.unwrap() <= 1);
    assert_eq!(storage.get_disk(&disk.id).unwrap().status, DiskStatus::Available);
}
