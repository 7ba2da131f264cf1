//! Mock hypervisor adapter for testing and development.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::{ControlError, Result};
use crate::factory::AdapterFactory;
use crate::traits::{AdapterCapabilities, HypervisorAdapter};
use crate::types::{
    generate_mac, ComputeHost, DiskAttachSpec, PowerState, VirtualizationType, VmConfig, VmInfo,
};

/// Adapter operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    TestConnection,
    Create,
    Start,
    Stop,
    Restart,
    Delete,
    Info,
    Status,
    Attach,
    Detach,
}

struct MockVm {
    info: VmInfo,
    /// device -> source
    disks: BTreeMap<String, String>,
}

/// In-memory adapter simulating one host.
///
/// Useful for:
/// - Unit and integration testing of the lifecycle managers
/// - Development without a hypervisor (`--dev`)
pub struct MockAdapter {
    host_id: String,
    kind: VirtualizationType,
    capabilities: RwLock<AdapterCapabilities>,
    vms: RwLock<HashMap<String, MockVm>>,
    unreachable: AtomicBool,
    failures: Mutex<VecDeque<(MockOp, ControlError)>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<MockOp, usize>>,
}

impl MockAdapter {
    pub fn new(host_id: impl Into<String>, kind: VirtualizationType) -> Self {
        let host_id = host_id.into();
        info!(host_id = %host_id, kind = %kind, "Creating mock hypervisor adapter");
        Self {
            host_id,
            kind,
            capabilities: RwLock::new(AdapterCapabilities {
                name: format!("mock/{}", kind),
                max_vcpus: 64,
                max_memory_gb: 512,
                max_gpus: 4,
                supports_hotplug: true,
                supports_bootstrap: true,
                disk_formats: vec!["qcow2".to_string(), "raw".to_string()],
            }),
            vms: RwLock::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the advertised capabilities.
    pub fn set_capabilities(&self, capabilities: AdapterCapabilities) {
        *self.capabilities.write().unwrap_or_else(|e| e.into_inner()) = capabilities;
    }

    /// Make every call fail with `BackendUnavailable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next call of `op` with `error`. Queued failures apply in order.
    pub fn fail_next(&self, op: MockOp, error: ControlError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((op, error));
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: MockOp) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn vm_count(&self) -> usize {
        self.vms.read().map(|v| v.len()).unwrap_or(0)
    }

    /// Change a VM's power state behind the control plane's back.
    pub fn set_power_state(&self, uuid: &str, state: PowerState) {
        if let Some(vm) = self.vms.write().unwrap_or_else(|e| e.into_inner()).get_mut(uuid) {
            vm.info.power_state = state;
        }
    }

    /// Remove a VM behind the control plane's back.
    pub fn forget_vm(&self, uuid: &str) {
        self.vms.write().unwrap_or_else(|e| e.into_inner()).remove(uuid);
    }

    /// Devices currently attached to a VM.
    pub fn attached_devices(&self, uuid: &str) -> Vec<String> {
        self.vms
            .read()
            .ok()
            .and_then(|vms| vms.get(uuid).map(|vm| vm.disks.keys().cloned().collect()))
            .unwrap_or_default()
    }

    async fn enter(&self, op: MockOp) -> Result<()> {
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

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ControlError::unavailable(&self.host_id, "mock host unreachable"));
        }

        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = failures.iter().position(|(o, _)| *o == op) {
            if let Some((_, error)) = failures.remove(pos) {
                debug!(?op, error = %error, "Injected failure");
                return Err(error);
            }
        }
        Ok(())
    }

    fn with_vm<T>(&self, uuid: &str, f: impl FnOnce(&mut MockVm) -> Result<T>) -> Result<T> {
        let mut vms = self
            .vms
            .write()
            .map_err(|_| ControlError::internal(&self.host_id, "lock poisoned"))?;
        let vm = vms.get_mut(uuid).ok_or_else(|| ControlError::not_found(uuid))?;
        f(vm)
    }
}

#[async_trait]
impl HypervisorAdapter for MockAdapter {
    fn kind(&self) -> VirtualizationType {
        self.kind
    }

    fn host_id(&self) -> &str {
        &self.host_id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn test_connection(&self) -> Result<bool> {
        match self.enter(MockOp::TestConnection).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, config), fields(host_id = %self.host_id, vm_name = %config.name))]
    async fn create_vm(&self, config: &VmConfig) -> Result<VmInfo> {
        self.capabilities().check(config)?;
        self.enter(MockOp::Create).await?;

        let mut vms = self
            .vms
            .write()
            .map_err(|_| ControlError::internal(&self.host_id, "lock poisoned"))?;

        // A retried create finds the VM from the earlier attempt
        if let Some(vm) = vms.values_mut().find(|vm| vm.info.name == config.name) {
            vm.info.power_state = PowerState::Running;
            return Ok(vm.info.clone());
        }

        let network = config.network.as_ref();
        let info = VmInfo {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: config.name.clone(),
            power_state: PowerState::Running,
            address: network.and_then(|n| n.address.clone()),
            mac: Some(network.and_then(|n| n.mac.clone()).unwrap_or_else(generate_mac)),
        };
        vms.insert(
            info.uuid.clone(),
            MockVm {
                info: info.clone(),
                disks: BTreeMap::new(),
            },
        );

        info!(uuid = %info.uuid, "Mock VM created");
        Ok(info)
    }

    async fn start_vm(&self, uuid: &str) -> Result<()> {
        self.enter(MockOp::Start).await?;
        self.with_vm(uuid, |vm| {
            vm.info.power_state = PowerState::Running;
            Ok(())
        })
    }

    async fn stop_vm(&self, uuid: &str, _force: bool) -> Result<()> {
        self.enter(MockOp::Stop).await?;
        self.with_vm(uuid, |vm| {
            vm.info.power_state = PowerState::Stopped;
            Ok(())
        })
    }

    async fn restart_vm(&self, uuid: &str) -> Result<()> {
        self.enter(MockOp::Restart).await?;
        self.with_vm(uuid, |vm| match vm.info.power_state {
            PowerState::Running => Ok(()),
            other => Err(ControlError::invalid_state(
                uuid,
                format!("cannot restart a VM that is {:?}", other),
            )),
        })
    }

    async fn delete_vm(&self, uuid: &str) -> Result<()> {
        self.enter(MockOp::Delete).await?;
        let mut vms = self
            .vms
            .write()
            .map_err(|_| ControlError::internal(&self.host_id, "lock poisoned"))?;
        match vms.get(uuid).map(|vm| vm.info.power_state) {
            None => Err(ControlError::not_found(uuid)),
            Some(PowerState::Stopped) => {
                vms.remove(uuid);
                Ok(())
            }
            Some(other) => Err(ControlError::invalid_state(
                uuid,
                format!("cannot delete a VM that is {:?}", other),
            )),
        }
    }

    async fn get_vm_info(&self, uuid: &str) -> Result<VmInfo> {
        self.enter(MockOp::Info).await?;
        self.with_vm(uuid, |vm| Ok(vm.info.clone()))
    }

    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>> {
        self.enter(MockOp::Info).await?;
        let vms = self
            .vms
            .read()
            .map_err(|_| ControlError::internal(&self.host_id, "lock poisoned"))?;
        Ok(vms.values().find(|vm| vm.info.name == name).map(|vm| vm.info.clone()))
    }

    async fn get_vm_status(&self, uuid: &str) -> Result<PowerState> {
        self.enter(MockOp::Status).await?;
        self.with_vm(uuid, |vm| Ok(vm.info.power_state))
    }

    async fn attach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<String> {
        self.enter(MockOp::Attach).await?;
        self.with_vm(uuid, |vm| {
            if let Some((device, _)) = vm.disks.iter().find(|(_, source)| **source == spec.source) {
                return Ok(device.clone());
            }
            let device = match &spec.device {
                Some(device) => device.clone(),
                None => ('b'..='z')
                    .map(|c| format!("vd{}", c))
                    .find(|d| !vm.disks.contains_key(d))
                    .ok_or_else(|| ControlError::capacity(uuid, "no free disk slots"))?,
            };
            vm.disks.insert(device.clone(), spec.source.clone());
            Ok(device)
        })
    }

    async fn detach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<()> {
        self.enter(MockOp::Detach).await?;
        self.with_vm(uuid, |vm| {
            let device = match &spec.device {
                Some(device) => Some(device.clone()),
                None => vm
                    .disks
                    .iter()
                    .find(|(_, source)| **source == spec.source)
                    .map(|(device, _)| device.clone()),
            };
            device
                .and_then(|device| vm.disks.remove(&device))
                .map(|_| ())
                .ok_or_else(|| ControlError::not_found(&spec.disk_id))
        })
    }
}

/// Factory handing out one [`MockAdapter`] per host.
#[derive(Default)]
pub struct MockFactory {
    adapters: Mutex<HashMap<String, Arc<MockAdapter>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The adapter for `host_id`, created on first use as a KVM host.
    pub fn adapter(&self, host_id: &str) -> Arc<MockAdapter> {
        self.adapter_of_kind(host_id, VirtualizationType::Kvm)
    }

    fn adapter_of_kind(&self, host_id: &str, kind: VirtualizationType) -> Arc<MockAdapter> {
        self.adapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(MockAdapter::new(host_id, kind)))
            .clone()
    }
}

impl AdapterFactory for MockFactory {
    fn adapter_for(&self, host: &ComputeHost) -> Result<Arc<dyn HypervisorAdapter>> {
        let kind = VirtualizationType::from_tag(&host.virtualization_type).ok_or_else(|| {
            ControlError::UnsupportedHypervisorType {
                entity: host.id.clone(),
                tag: host.virtualization_type.clone(),
            }
        })?;
        Ok(self.adapter_of_kind(&host.id, kind))
    }
}
