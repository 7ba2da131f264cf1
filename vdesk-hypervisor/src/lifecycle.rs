//! VM lifecycle management.
//!
//! The [`VmLifecycleManager`] owns VM records and is the only writer of
//! their state. Every operation takes the VM's entity lock, validates the
//! transition against the recorded state, calls the host's adapter with
//! bounded retry for transient failures and persists the outcome. A
//! surfaced adapter failure leaves the record in `Error` with the failure
//! text; status queries reconcile the record with the backend.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use crate::attachment::AttachmentIndex;
use crate::connection::ConnectionRegistry;
use crate::error::{ControlError, Result};
use crate::factory::AdapterFactory;
use crate::locks::{EntityGuard, EntityLocks};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{RecordTable, INTERRUPTED};
use crate::traits::HypervisorAdapter;
use crate::types::{ComputeHost, PowerState, Reachability, VmConfig, VmInfo, VmInstance, VmState};

/// Tunables for the VM lifecycle manager.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Retry policy for transient adapter failures
    pub retry: RetryPolicy,
    /// Status polls while waiting for a new VM to report running
    pub provisioning_poll_attempts: u32,
    /// Delay between provisioning polls
    pub provisioning_poll_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            provisioning_poll_attempts: 30,
            provisioning_poll_interval_ms: 2000,
        }
    }
}

/// Orchestrates VM create/start/stop/restart/delete and status queries.
pub struct VmLifecycleManager {
    registry: Arc<ConnectionRegistry>,
    factory: Arc<dyn AdapterFactory>,
    vms: RecordTable<VmInstance>,
    locks: EntityLocks,
    config: LifecycleConfig,
}

impl VmLifecycleManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        factory: Arc<dyn AdapterFactory>,
        vms: RecordTable<VmInstance>,
        config: LifecycleConfig,
    ) -> Self {
        settle_interrupted(&vms);
        Self {
            registry,
            factory,
            vms,
            locks: EntityLocks::new("vm"),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    fn adapter_for_host(&self, host_id: &str) -> Result<Arc<dyn HypervisorAdapter>> {
        let host = self.registry.get_host(host_id)?;
        self.factory.adapter_for(&host)
    }

    fn backend_uuid(vm: &VmInstance) -> Result<&str> {
        vm.uuid
            .as_deref()
            .ok_or_else(|| ControlError::invalid_state(&vm.id, "VM has no backend instance"))
    }

    /// Record a surfaced adapter failure and return it attributed to the VM.
    fn fail(&self, id: &str, err: ControlError) -> ControlError {
        let err = err.with_entity(id);
        error!(vm_id = %id, kind = %err.kind(), error = %err, "VM operation failed");
        let message = err.to_string();
        if let Err(e) = self.vms.update(id, |vm| {
            vm.transition(VmState::Error);
            vm.last_error = Some(message);
        }) {
            warn!(vm_id = %id, error = %e, "Failed to record VM error state");
        }
        err
    }

    fn set_state(&self, id: &str, state: VmState) -> Result<VmInstance> {
        self.vms.update(id, |vm| vm.transition(state))
    }

    /// Create a VM on a host and wait for it to run.
    ///
    /// The config is validated against its shape and the adapter's limits
    /// before any record exists. After that a `Requested` record is kept
    /// whatever the outcome, ending in `Running` or `Error`.
    #[instrument(skip(self, config), fields(vm_name = %config.name))]
    pub async fn create_vm(&self, host_id: &str, config: VmConfig) -> Result<VmInstance> {
        config.validate()?;
        let adapter = self.adapter_for_host(host_id)?;
        adapter.capabilities().check(&config)?;

        let taken = self
            .vms
            .filter(|vm| vm.host_id == host_id && vm.name == config.name && vm.state != VmState::Deleted);
        if !taken.is_empty() {
            return Err(ControlError::conflict(
                &config.name,
                format!("a VM with this name already exists on host {}", host_id),
            ));
        }

        let id = format!("vm-{}", uuid::Uuid::new_v4());
        self.vms.insert(&id, VmInstance::requested(id.clone(), host_id, &config))?;
        let _guard = self.locks.lock(&id).await;
        info!(vm_id = %id, "VM requested");

        let adapter_ref = adapter.as_ref();
        let config_ref = &config;
        let created = with_retry(&self.config.retry, "create_vm", &id, || adapter_ref.create_vm(config_ref)).await;
        let info = match created {
            Ok(info) => info,
            Err(e) => return Err(self.fail(&id, e)),
        };

        self.vms.update(&id, |vm| {
            vm.uuid = Some(info.uuid.clone());
            if info.address.is_some() {
                vm.address = info.address.clone();
            }
            if info.mac.is_some() {
                vm.mac = info.mac.clone();
            }
            vm.transition(VmState::Provisioning);
        })?;
        info!(vm_id = %id, uuid = %info.uuid, "VM provisioning");

        if let Err(e) = self.await_running(adapter_ref, &id, &info).await {
            return Err(self.fail(&id, e));
        }
        let vm = self.set_state(&id, VmState::Running)?;
        info!(vm_id = %id, "VM running");
        Ok(vm)
    }

    async fn await_running(&self, adapter: &dyn HypervisorAdapter, id: &str, info: &VmInfo) -> Result<()> {
        if info.power_state == PowerState::Running {
            return Ok(());
        }
        let interval = Duration::from_millis(self.config.provisioning_poll_interval_ms);
        for attempt in 1..=self.config.provisioning_poll_attempts {
            tokio::time::sleep(interval).await;
            let power = with_retry(&self.config.retry, "get_vm_status", id, || adapter.get_vm_status(&info.uuid)).await?;
            debug!(vm_id = %id, attempt, ?power, "Provisioning poll");
            if power == PowerState::Running {
                return Ok(());
            }
        }
        Err(ControlError::Timeout {
            entity: id.to_string(),
            timeout_ms: interval.as_millis() as u64 * u64::from(self.config.provisioning_poll_attempts),
        })
    }

    /// Power on a stopped VM. Starting a running VM is a no-op.
    #[instrument(skip(self))]
    pub async fn start_vm(&self, vm_id: &str) -> Result<VmInstance> {
        let _guard = self.locks.lock(vm_id).await;
        let vm = self.vms.require(vm_id)?;
        match vm.state {
            VmState::Running => return Ok(vm),
            VmState::Stopped => {}
            other => {
                return Err(ControlError::invalid_state(vm_id, format!("cannot start a VM that is {}", other)));
            }
        }

        let uuid = Self::backend_uuid(&vm)?;
        let adapter = self.adapter_for_host(&vm.host_id)?;
        let adapter_ref = adapter.as_ref();
        if let Err(e) = with_retry(&self.config.retry, "start_vm", vm_id, || adapter_ref.start_vm(uuid)).await {
            return Err(self.fail(vm_id, e));
        }

        info!(vm_id = %vm_id, "VM started");
        self.set_state(vm_id, VmState::Running)
    }

    /// Power off a running VM. Stopping a stopped VM is a no-op.
    #[instrument(skip(self))]
    pub async fn stop_vm(&self, vm_id: &str, force: bool) -> Result<VmInstance> {
        let _guard = self.locks.lock(vm_id).await;
        let vm = self.vms.require(vm_id)?;
        match vm.state {
            VmState::Stopped => return Ok(vm),
            VmState::Running => {}
            other => {
                return Err(ControlError::invalid_state(vm_id, format!("cannot stop a VM that is {}", other)));
            }
        }

        let uuid = Self::backend_uuid(&vm)?;
        let adapter = self.adapter_for_host(&vm.host_id)?;
        let adapter_ref = adapter.as_ref();
        if let Err(e) = with_retry(&self.config.retry, "stop_vm", vm_id, || adapter_ref.stop_vm(uuid, force)).await {
            return Err(self.fail(vm_id, e));
        }

        info!(vm_id = %vm_id, force, "VM stopped");
        self.set_state(vm_id, VmState::Stopped)
    }

    /// Reboot a running VM, passing through `Restarting`.
    #[instrument(skip(self))]
    pub async fn restart_vm(&self, vm_id: &str) -> Result<VmInstance> {
        let _guard = self.locks.lock(vm_id).await;
        let vm = self.vms.require(vm_id)?;
        if vm.state != VmState::Running {
            return Err(ControlError::invalid_state(
                vm_id,
                format!("cannot restart a VM that is {}", vm.state),
            ));
        }

        let uuid = Self::backend_uuid(&vm)?;
        let adapter = self.adapter_for_host(&vm.host_id)?;
        self.set_state(vm_id, VmState::Restarting)?;

        let adapter_ref = adapter.as_ref();
        if let Err(e) = with_retry(&self.config.retry, "restart_vm", vm_id, || adapter_ref.restart_vm(uuid)).await {
            return Err(self.fail(vm_id, e));
        }

        info!(vm_id = %vm_id, "VM restarted");
        self.set_state(vm_id, VmState::Running)
    }

    /// Delete a VM from `Running`, `Stopped` or `Error`.
    ///
    /// A running VM is forced off first; both steps happen under one
    /// `Deleting` transition. Refused with `Conflict` while disks are
    /// attached. A VM the backend no longer knows is treated as gone.
    #[instrument(skip(self, attachments))]
    pub async fn delete_vm(&self, vm_id: &str, attachments: &dyn AttachmentIndex) -> Result<VmInstance> {
        let _guard = self.locks.lock(vm_id).await;
        let vm = self.vms.require(vm_id)?;
        match vm.state {
            VmState::Running | VmState::Stopped | VmState::Error => {}
            other => {
                return Err(ControlError::invalid_state(vm_id, format!("cannot delete a VM that is {}", other)));
            }
        }

        let active = attachments.active_for_vm(vm_id);
        if !active.is_empty() {
            return Err(ControlError::conflict(
                vm_id,
                format!("{} disk(s) still attached", active.len()),
            ));
        }

        self.set_state(vm_id, VmState::Deleting)?;

        let adapter = match self.adapter_for_host(&vm.host_id) {
            Ok(adapter) => adapter,
            Err(e) => return Err(self.fail(vm_id, e)),
        };
        let adapter_ref = adapter.as_ref();
        let destroyed = match self.resolve_uuid(adapter_ref, &vm).await {
            Ok(Some(uuid)) => self.destroy_backend_vm(adapter_ref, vm_id, &uuid).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = destroyed {
            return Err(self.fail(vm_id, e));
        }

        info!(vm_id = %vm_id, "VM deleted");
        self.set_state(vm_id, VmState::Deleted)
    }

    /// Backend uuid for a record, adopting a same-named backend VM when the
    /// record never learned one.
    async fn resolve_uuid(&self, adapter: &dyn HypervisorAdapter, vm: &VmInstance) -> Result<Option<String>> {
        if let Some(uuid) = &vm.uuid {
            return Ok(Some(uuid.clone()));
        }
        let name = vm.name.as_str();
        let found = with_retry(&self.config.retry, "find_vm", &vm.id, || adapter.find_vm(name)).await?;
        let Some(info) = found else {
            debug!(vm_id = %vm.id, "No backend VM to adopt");
            return Ok(None);
        };

        warn!(vm_id = %vm.id, uuid = %info.uuid, "Adopted backend VM by name");
        self.vms.update(&vm.id, |vm| {
            vm.uuid = Some(info.uuid.clone());
            if info.address.is_some() {
                vm.address = info.address.clone();
            }
            if info.mac.is_some() {
                vm.mac = info.mac.clone();
            }
        })?;
        Ok(Some(info.uuid))
    }

    async fn destroy_backend_vm(&self, adapter: &dyn HypervisorAdapter, vm_id: &str, uuid: &str) -> Result<()> {
        let retry = &self.config.retry;

        let power = match with_retry(retry, "get_vm_status", vm_id, || adapter.get_vm_status(uuid)).await {
            Ok(power) => power,
            Err(ControlError::NotFound { .. }) => {
                warn!(vm_id = %vm_id, uuid = %uuid, "VM already absent on backend");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if power != PowerState::Stopped {
            debug!(vm_id = %vm_id, ?power, "Forcing power off before delete");
            with_retry(retry, "stop_vm", vm_id, || adapter.stop_vm(uuid, true)).await?;
        }

        match with_retry(retry, "delete_vm", vm_id, || adapter.delete_vm(uuid)).await {
            Ok(()) | Err(ControlError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current record, reconciled with the backend's power state.
    ///
    /// A definite backend state that disagrees with the record replaces it.
    /// A VM the backend no longer knows is marked `Error`. A record without
    /// a uuid adopts the backend VM of the same name, if there is one.
    #[instrument(skip(self))]
    pub async fn get_vm_status(&self, vm_id: &str) -> Result<VmInstance> {
        let _guard = self.locks.lock(vm_id).await;
        let vm = self.vms.require(vm_id)?;
        if vm.state == VmState::Deleted {
            return Ok(vm);
        }

        let adapter = self.adapter_for_host(&vm.host_id)?;
        let adapter_ref = adapter.as_ref();
        let uuid = match vm.uuid.clone() {
            Some(uuid) => uuid,
            None => match self.resolve_uuid(adapter_ref, &vm).await.map_err(|e| e.with_entity(vm_id))? {
                Some(uuid) => uuid,
                None => return Ok(vm),
            },
        };

        let power = match with_retry(&self.config.retry, "get_vm_status", vm_id, || adapter_ref.get_vm_status(&uuid)).await {
            Ok(power) => power,
            Err(ControlError::NotFound { .. }) => {
                warn!(vm_id = %vm_id, uuid = %uuid, recorded = %vm.state, "VM missing on backend");
                return self.vms.update(vm_id, |vm| {
                    vm.transition(VmState::Error);
                    vm.last_error = Some("VM not found on backend".to_string());
                });
            }
            Err(e) => return Err(e.with_entity(vm_id)),
        };

        match VmState::from_power(power) {
            Some(actual) if actual != vm.state => {
                warn!(vm_id = %vm_id, recorded = %vm.state, backend = %actual, "VM state reconciled with backend");
                self.set_state(vm_id, actual)
            }
            _ => self.vms.require(vm_id),
        }
    }

    /// Backend details for a VM.
    pub async fn get_vm_info(&self, vm_id: &str) -> Result<VmInfo> {
        let vm = self.vms.require(vm_id)?;
        if vm.state == VmState::Deleted {
            return Err(ControlError::invalid_state(vm_id, "VM is deleted"));
        }
        let uuid = Self::backend_uuid(&vm)?;
        let adapter = self.adapter_for_host(&vm.host_id)?;
        let adapter_ref = adapter.as_ref();
        with_retry(&self.config.retry, "get_vm_info", vm_id, || adapter_ref.get_vm_info(uuid))
            .await
            .map_err(|e| e.with_entity(vm_id))
    }

    pub fn get_vm(&self, vm_id: &str) -> Result<VmInstance> {
        self.vms.require(vm_id)
    }

    /// All VM records, optionally restricted to one host.
    pub fn list_vms(&self, host_id: Option<&str>) -> Vec<VmInstance> {
        match host_id {
            Some(host) => self.vms.filter(|vm| vm.host_id == host),
            None => self.vms.list(),
        }
    }

    /// Check a host and record its reachability.
    #[instrument(skip(self))]
    pub async fn test_host(&self, host_id: &str) -> Result<ComputeHost> {
        let adapter = self.adapter_for_host(host_id)?;
        let reachable = adapter.test_connection().await?;
        let reachability = if reachable {
            Reachability::Reachable
        } else {
            Reachability::Unreachable
        };
        info!(host_id = %host_id, ?reachability, "Host checked");
        self.registry.set_reachability(host_id, reachability)
    }

    /// Remove a host that no live VM references.
    pub fn remove_host(&self, host_id: &str) -> Result<()> {
        self.registry.get_host(host_id)?;
        let live = self
            .vms
            .filter(|vm| vm.host_id == host_id && vm.state != VmState::Deleted);
        if !live.is_empty() {
            return Err(ControlError::conflict(
                host_id,
                format!("{} VM(s) still reference this host", live.len()),
            ));
        }
        self.registry.remove_host(host_id)
    }

    /// Take the VM's entity lock.
    pub(crate) async fn lock_vm(&self, vm_id: &str) -> EntityGuard {
        self.locks.lock(vm_id).await
    }

    /// Record and adapter for a VM whose lock the caller holds.
    pub(crate) fn attach_target(&self, guard: &EntityGuard) -> Result<(VmInstance, Arc<dyn HypervisorAdapter>)> {
        let vm = self.vms.require(guard.id())?;
        let adapter = self.adapter_for_host(&vm.host_id)?;
        Ok((vm, adapter))
    }
}

/// Move records left mid-operation by a previous process to `Error`.
///
/// No lock can be held across a restart, so the outcome of whatever was
/// running is unknown. `Error` lets the VM be deleted or reconciled.
fn settle_interrupted(vms: &RecordTable<VmInstance>) {
    for vm in vms.filter(|vm| vm.state.is_in_progress()) {
        warn!(vm_id = %vm.id, state = %vm.state, "VM operation interrupted by restart");
        if let Err(e) = vms.update(&vm.id, |vm| {
            vm.transition(VmState::Error);
            vm.last_error = Some(INTERRUPTED.to_string());
        }) {
            warn!(vm_id = %vm.id, error = %e, "Failed to settle interrupted VM");
        }
    }
}
