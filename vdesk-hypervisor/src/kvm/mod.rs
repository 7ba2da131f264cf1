//! KVM adapter.
//!
//! Drives libvirt with `virsh -c <uri>` over the host's SSH connection.
//! Descriptor options:
//!
//! - `uri`: libvirt connection URI on the host (default `qemu:///system`)
//! - `pool`: storage pool for root volumes (default `default`)
//! - `network`: libvirt network for the primary NIC (default `default`)

mod xml;

pub use xml::{parse_block_devices, parse_interface_mac, BlockDevice, DomainXmlBuilder};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::connection::{first_line, HostHandle, RemoteOutput, RemoteRequest};
use crate::error::{ControlError, Result};
use crate::traits::{reachability_outcome, AdapterCapabilities, HypervisorAdapter};
use crate::types::{generate_mac, DiskAttachSpec, PowerState, VirtualizationType, VmConfig, VmInfo};

/// libvirt/KVM adapter bound to one host.
pub struct KvmAdapter {
    host: HostHandle,
    uri: String,
    pool: String,
    network: String,
    shutdown_poll_interval: Duration,
    shutdown_poll_attempts: u32,
}

impl KvmAdapter {
    pub fn new(host: HostHandle) -> Self {
        let desc = host.descriptor();
        let uri = desc.option_or("uri", "qemu:///system").to_string();
        let pool = desc.option_or("pool", "default").to_string();
        let network = desc.option_or("network", "default").to_string();
        Self {
            host,
            uri,
            pool,
            network,
            shutdown_poll_interval: Duration::from_secs(2),
            shutdown_poll_attempts: 15,
        }
    }

    /// How long a graceful shutdown may take before the domain is destroyed.
    pub fn with_shutdown_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.shutdown_poll_interval = interval;
        self.shutdown_poll_attempts = attempts;
        self
    }

    fn virsh(&self, args: &[&str]) -> RemoteRequest {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        RemoteRequest::shell("virsh", full)
    }

    /// Run `virsh` and return the raw output. Only transport failures are errors.
    async fn exec(&self, args: &[&str]) -> Result<RemoteOutput> {
        self.host.run(self.virsh(args)).await
    }

    /// Run `virsh` and return stdout, classifying a failing exit status.
    async fn run(&self, entity: &str, args: &[&str]) -> Result<String> {
        let output = self.exec(args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify(entity, &output))
        }
    }

    async fn run_with_stdin(&self, entity: &str, args: &[&str], stdin: String) -> Result<String> {
        let output = self.host.run(self.virsh(args).with_stdin(stdin)).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify(entity, &output))
        }
    }

    async fn domain_uuid(&self, name: &str) -> Result<String> {
        Ok(self.run(name, &["domuuid", name]).await?.trim().to_string())
    }
}

/// Map a failed `virsh` invocation to the error taxonomy.
fn classify(entity: &str, output: &RemoteOutput) -> ControlError {
    let message = first_line(&output.stderr).to_string();
    let lower = output.stderr.to_lowercase();

    if lower.contains("failed to get domain")
        || lower.contains("domain not found")
        || lower.contains("no disk found")
        || lower.contains("storage volume not found")
    {
        ControlError::not_found(entity)
    } else if lower.contains("failed to connect to the hypervisor")
        || lower.contains("connection refused")
        || lower.contains("cannot recv data")
        || lower.contains("end of file while reading data")
    {
        ControlError::unavailable(entity, message)
    } else if lower.contains("cannot allocate memory")
        || lower.contains("no space left")
        || lower.contains("not enough free space")
        || lower.contains("insufficient")
    {
        ControlError::capacity(entity, message)
    } else if lower.contains("exists already") || lower.contains("already exists") || lower.contains("already in use") {
        ControlError::conflict(entity, message)
    } else if lower.contains("requested operation is not valid")
        || lower.contains("is not running")
        || lower.contains("already active")
    {
        ControlError::invalid_state(entity, message)
    } else if lower.contains("invalid argument") || lower.contains("unsupported configuration") {
        ControlError::validation(entity, message)
    } else {
        ControlError::internal(entity, format!("virsh exited with {}: {}", output.status, message))
    }
}

fn parse_power_state(state: &str) -> PowerState {
    match state.trim() {
        "running" | "idle" => PowerState::Running,
        "shut off" | "crashed" => PowerState::Stopped,
        "paused" | "pmsuspended" => PowerState::Paused,
        "in shutdown" => PowerState::Stopping,
        _ => PowerState::Unknown,
    }
}

fn parse_dominfo(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[async_trait]
impl HypervisorAdapter for KvmAdapter {
    fn kind(&self) -> VirtualizationType {
        VirtualizationType::Kvm
    }

    fn host_id(&self) -> &str {
        self.host.host_id()
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            name: "libvirt/KVM".to_string(),
            max_vcpus: 256,
            max_memory_gb: 4096,
            max_gpus: 0,
            supports_hotplug: true,
            supports_bootstrap: true,
            disk_formats: vec!["qcow2".to_string(), "raw".to_string()],
        }
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn test_connection(&self) -> Result<bool> {
        let result = self.exec(&["version"]).await;
        reachability_outcome(self.host.host_id(), result, |o| o.success())
    }

    #[instrument(skip(self, config), fields(host_id = %self.host.host_id(), vm_name = %config.name))]
    async fn create_vm(&self, config: &VmConfig) -> Result<VmInfo> {
        self.capabilities().check(config)?;
        let name = config.name.as_str();

        // A retried create finds the domain defined by the earlier attempt
        match self.domain_uuid(name).await {
            Ok(uuid) => {
                info!(uuid = %uuid, "Domain already defined, resuming creation");
                self.start_vm(&uuid).await?;
                return self.get_vm_info(&uuid).await;
            }
            Err(ControlError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let volume = format!("{}-root.qcow2", name);
        let size = format!("{}G", config.storage_gb);
        let mut args = vec!["vol-create-as", self.pool.as_str(), volume.as_str(), size.as_str(), "--format", "qcow2"];
        if let Some(image) = &config.image {
            args.extend(["--backing-vol", image.as_str(), "--backing-vol-format", "qcow2"]);
        }
        match self.run(name, &args).await {
            Ok(_) => debug!(volume = %volume, "Root volume created"),
            Err(ControlError::Conflict { .. }) => debug!(volume = %volume, "Root volume already exists"),
            Err(e) => return Err(e),
        }

        let disk_path = self
            .run(name, &["vol-path", "--pool", self.pool.as_str(), volume.as_str()])
            .await?
            .trim()
            .to_string();

        let mac = config
            .network
            .as_ref()
            .and_then(|n| n.mac.clone())
            .unwrap_or_else(generate_mac);
        let domain_xml = DomainXmlBuilder::new(config, &disk_path, &mac, &self.network).build();

        if let Err(e) = self.run_with_stdin(name, &["define", "/dev/stdin"], domain_xml).await {
            if let Err(cleanup) = self.run(name, &["vol-delete", "--pool", self.pool.as_str(), volume.as_str()]).await {
                warn!(volume = %volume, error = %cleanup, "Failed to remove root volume after define failure");
            }
            return Err(e);
        }

        self.run(name, &["start", name]).await?;
        let uuid = self.domain_uuid(name).await?;
        info!(uuid = %uuid, "Domain defined and started");

        let mut vm = self.get_vm_info(&uuid).await?;
        if vm.address.is_none() {
            vm.address = config.network.as_ref().and_then(|n| n.address.clone());
        }
        Ok(vm)
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn start_vm(&self, uuid: &str) -> Result<()> {
        let output = match self.get_vm_status(uuid).await? {
            PowerState::Running => {
                debug!("Domain already running");
                return Ok(());
            }
            PowerState::Paused => self.exec(&["resume", uuid]).await?,
            _ => self.exec(&["start", uuid]).await?,
        };

        if output.success() || output.stderr.contains("already active") {
            info!("Domain started");
            Ok(())
        } else {
            Err(classify(uuid, &output))
        }
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn stop_vm(&self, uuid: &str, force: bool) -> Result<()> {
        if self.get_vm_status(uuid).await? == PowerState::Stopped {
            debug!("Domain already stopped");
            return Ok(());
        }

        if !force {
            let output = self.exec(&["shutdown", uuid]).await?;
            if !output.success() && !output.stderr.contains("is not running") {
                return Err(classify(uuid, &output));
            }
            for _ in 0..self.shutdown_poll_attempts {
                tokio::time::sleep(self.shutdown_poll_interval).await;
                if self.get_vm_status(uuid).await? == PowerState::Stopped {
                    info!("Domain shut down gracefully");
                    return Ok(());
                }
            }
            warn!("Graceful shutdown timed out, forcing power off");
        }

        let output = self.exec(&["destroy", uuid]).await?;
        if output.success() || output.stderr.contains("is not running") {
            info!("Domain powered off");
            Ok(())
        } else {
            Err(classify(uuid, &output))
        }
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn restart_vm(&self, uuid: &str) -> Result<()> {
        let state = self.get_vm_status(uuid).await?;
        if state != PowerState::Running {
            return Err(ControlError::invalid_state(
                uuid,
                format!("cannot restart a domain that is {:?}", state),
            ));
        }
        self.run(uuid, &["reboot", uuid]).await?;
        info!("Domain reboot requested");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn delete_vm(&self, uuid: &str) -> Result<()> {
        let state = self.get_vm_status(uuid).await?;
        if state != PowerState::Stopped {
            return Err(ControlError::invalid_state(
                uuid,
                format!("cannot delete a domain that is {:?}", state),
            ));
        }
        // Only the root volume goes with the domain; data disks are managed separately
        self.run(uuid, &["undefine", uuid, "--storage", "vda", "--nvram"]).await?;
        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn get_vm_info(&self, uuid: &str) -> Result<VmInfo> {
        let info = parse_dominfo(&self.run(uuid, &["dominfo", uuid]).await?);
        let power_state = parse_power_state(info.get("State").map(String::as_str).unwrap_or(""));
        let domain_xml = self.run(uuid, &["dumpxml", uuid]).await?;

        let address = if power_state == PowerState::Running {
            match self.run(uuid, &["domifaddr", uuid]).await {
                Ok(out) => xml::parse_address(&out),
                Err(e) if e.is_transient() => return Err(e),
                Err(_) => None,
            }
        } else {
            None
        };

        Ok(VmInfo {
            uuid: info.get("UUID").cloned().unwrap_or_else(|| uuid.to_string()),
            name: info.get("Name").cloned().unwrap_or_default(),
            power_state,
            address,
            mac: parse_interface_mac(&domain_xml),
        })
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>> {
        match self.domain_uuid(name).await {
            Ok(uuid) => self.get_vm_info(&uuid).await.map(Some),
            Err(ControlError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_vm_status(&self, uuid: &str) -> Result<PowerState> {
        let out = self.run(uuid, &["domstate", uuid]).await?;
        Ok(parse_power_state(first_line(&out)))
    }

    #[instrument(skip(self, spec), fields(host_id = %self.host.host_id(), disk_id = %spec.disk_id))]
    async fn attach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<String> {
        self.capabilities().check_disk_format(&spec.disk_id, &spec.format)?;
        let live = self.get_vm_status(uuid).await? == PowerState::Running;
        let devices = parse_block_devices(&self.run(uuid, &["domblklist", uuid, "--details"]).await?);

        if let Some(existing) = devices.iter().find(|d| d.source == spec.source) {
            debug!(target = %existing.target, "Disk already attached");
            return Ok(existing.target.clone());
        }

        let target = match &spec.device {
            Some(device) => device.clone(),
            None => xml::next_free_target(&devices)
                .ok_or_else(|| ControlError::capacity(uuid, "no free virtio disk targets"))?,
        };

        let scope = if live { "--persistent" } else { "--config" };
        self.run(
            &spec.disk_id,
            &[
                "attach-disk",
                uuid,
                spec.source.as_str(),
                target.as_str(),
                "--driver",
                "qemu",
                "--subdriver",
                spec.format.as_str(),
                "--targetbus",
                "virtio",
                scope,
            ],
        )
        .await?;

        info!(target = %target, live, "Disk attached");
        Ok(target)
    }

    #[instrument(skip(self, spec), fields(host_id = %self.host.host_id(), disk_id = %spec.disk_id))]
    async fn detach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<()> {
        // virsh accepts either the target or the source path
        let target = spec.device.as_deref().unwrap_or(spec.source.as_str());
        let live = self.get_vm_status(uuid).await? == PowerState::Running;
        let scope = if live { "--persistent" } else { "--config" };

        self.run(&spec.disk_id, &["detach-disk", uuid, target, scope]).await?;
        info!(target = %target, live, "Disk detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{
        ConnectionRegistry, Credential, CredentialStore, RegistryConfig, ScriptedExecutor,
    };
    use crate::store::RecordTable;
    use crate::types::{ConnectionDescriptor, HostRegistration, TransportKind};
    use std::sync::Arc;

    fn adapter() -> (KvmAdapter, Arc<ScriptedExecutor>) {
        let executor = Arc::new(ScriptedExecutor::new());
        let credentials = Arc::new(CredentialStore::new());
        credentials.insert("root", Credential::key("root", "/etc/vdesk/id_ed25519"));
        let registry = Arc::new(ConnectionRegistry::new(
            RecordTable::in_memory("hosts"),
            credentials,
            executor.clone(),
            RegistryConfig::default(),
        ));
        registry
            .register_host(HostRegistration {
                id: Some("kvm-1".into()),
                virtualization_type: "kvm".into(),
                connection: ConnectionDescriptor::new("10.0.0.5", 22, "root", TransportKind::Ssh)
                    .with_option("pool", "vdesk"),
            })
            .unwrap();
        let adapter = KvmAdapter::new(registry.handle("kvm-1").unwrap())
            .with_shutdown_poll(Duration::from_millis(1), 3);
        (adapter, executor)
    }

    const DOMINFO: &str = "Id:             3\nName:           desk-01\nUUID:           6f1c2b1e-0000-4000-8000-000000000001\nState:          running\n";

    #[tokio::test]
    async fn test_create_defines_and_starts_domain() {
        let (adapter, exec) = adapter();
        exec.respond_once("domuuid desk-01", RemoteOutput::failed(1, "error: failed to get domain 'desk-01'"));
        exec.respond("vol-path", RemoteOutput::ok("/var/lib/vdesk/desk-01-root.qcow2\n"));
        exec.respond("domuuid desk-01", RemoteOutput::ok("6f1c2b1e-0000-4000-8000-000000000001\n"));
        exec.respond("dominfo", RemoteOutput::ok(DOMINFO));
        exec.respond(
            "dumpxml",
            RemoteOutput::ok("<domain><devices><interface type='network'><mac address='52:54:00:01:02:03'/></interface></devices></domain>"),
        );

        let config = VmConfig::new("desk-01").with_image("golden-win11.qcow2");
        let vm = adapter.create_vm(&config).await.unwrap();

        assert_eq!(vm.uuid, "6f1c2b1e-0000-4000-8000-000000000001");
        assert_eq!(vm.power_state, PowerState::Running);
        assert_eq!(vm.mac.as_deref(), Some("52:54:00:01:02:03"));

        let calls = exec.described();
        assert!(calls.iter().any(|c| c.contains("vol-create-as vdesk desk-01-root.qcow2 40G --format qcow2 --backing-vol golden-win11.qcow2")));
        assert!(calls.iter().any(|c| c.ends_with("define /dev/stdin")));
        assert!(calls.iter().any(|c| c.ends_with("start desk-01")));

        let (_, define) = exec
            .requests()
            .into_iter()
            .find(|(_, r)| r.describe().ends_with("define /dev/stdin"))
            .unwrap();
        match define {
            RemoteRequest::Shell { stdin: Some(xml), .. } => assert!(xml.contains("<name>desk-01</name>")),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (adapter, exec) = adapter();
        exec.respond("domstate", RemoteOutput::ok("running\n"));
        adapter.start_vm("vm-1").await.unwrap();
        assert_eq!(exec.count("virsh -c qemu:///system start"), 0);

        exec.respond("domstate", RemoteOutput::ok("shut off\n"));
        adapter.stop_vm("vm-1", false).await.unwrap();
        assert_eq!(exec.count("shutdown"), 0);
        assert_eq!(exec.count("destroy"), 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_falls_back_to_destroy() {
        let (adapter, exec) = adapter();
        exec.respond("domstate", RemoteOutput::ok("running\n"));

        adapter.stop_vm("vm-1", false).await.unwrap();
        assert_eq!(exec.count("shutdown vm-1"), 1);
        assert_eq!(exec.count("destroy vm-1"), 1);
    }

    #[tokio::test]
    async fn test_unknown_domain_is_not_found() {
        let (adapter, exec) = adapter();
        exec.respond(
            "domstate",
            RemoteOutput::failed(1, "error: failed to get domain 'ghost'\nerror: Domain not found"),
        );
        assert!(matches!(adapter.start_vm("ghost").await, Err(ControlError::NotFound { .. })));
        assert!(matches!(adapter.get_vm_status("ghost").await, Err(ControlError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_running_domain_is_invalid_state() {
        let (adapter, exec) = adapter();
        exec.respond("domstate", RemoteOutput::ok("running\n"));
        assert!(matches!(adapter.delete_vm("vm-1").await, Err(ControlError::InvalidState { .. })));

        exec.respond("domstate", RemoteOutput::ok("shut off\n"));
        adapter.delete_vm("vm-1").await.unwrap();
        assert_eq!(exec.count("undefine vm-1 --storage vda"), 1);
    }

    #[tokio::test]
    async fn test_attach_picks_free_target() {
        let (adapter, exec) = adapter();
        exec.respond("domstate", RemoteOutput::ok("running\n"));
        exec.respond(
            "domblklist",
            RemoteOutput::ok(" Type   Device   Target   Source\n---------\n file   disk     vda      /images/root.qcow2\n"),
        );
        let spec = DiskAttachSpec {
            disk_id: "disk-1".into(),
            source: "/var/lib/vdesk/disks/disk-1.qcow2".into(),
            format: "qcow2".into(),
            device: None,
        };

        let device = adapter.attach_disk("vm-1", &spec).await.unwrap();
        assert_eq!(device, "vdb");
        assert_eq!(exec.count("attach-disk vm-1 /var/lib/vdesk/disks/disk-1.qcow2 vdb"), 1);
        assert_eq!(exec.count("--persistent"), 1);
    }

    #[tokio::test]
    async fn test_find_vm_by_name() {
        let (adapter, exec) = adapter();
        exec.respond_once("domuuid desk-02", RemoteOutput::failed(1, "error: failed to get domain 'desk-02'"));
        assert!(adapter.find_vm("desk-02").await.unwrap().is_none());

        exec.respond("domuuid desk-01", RemoteOutput::ok("6f1c2b1e-0000-4000-8000-000000000001\n"));
        exec.respond("dominfo", RemoteOutput::ok(DOMINFO));
        let vm = adapter.find_vm("desk-01").await.unwrap().unwrap();
        assert_eq!(vm.uuid, "6f1c2b1e-0000-4000-8000-000000000001");
        assert_eq!(vm.power_state, PowerState::Running);
    }

    #[tokio::test]
    async fn test_detach_without_target_uses_source_path() {
        let (adapter, exec) = adapter();
        exec.respond("domstate", RemoteOutput::ok("shut off\n"));
        exec.respond_once(
            "detach-disk",
            RemoteOutput::failed(1, "error: No disk found whose source path or target is /var/lib/vdesk/disks/disk-1.qcow2"),
        );
        let spec = DiskAttachSpec {
            disk_id: "disk-1".into(),
            source: "/var/lib/vdesk/disks/disk-1.qcow2".into(),
            format: "qcow2".into(),
            device: None,
        };

        assert!(matches!(
            adapter.detach_disk("vm-1", &spec).await,
            Err(ControlError::NotFound { .. })
        ));
        adapter.detach_disk("vm-1", &spec).await.unwrap();
        assert_eq!(exec.count("detach-disk vm-1 /var/lib/vdesk/disks/disk-1.qcow2 --config"), 2);
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_false() {
        let (adapter, exec) = adapter();
        exec.fail("version", ControlError::unavailable("kvm-1", "ssh: connect to host 10.0.0.5 port 22: Connection refused"));
        assert!(!adapter.test_connection().await.unwrap());
    }

    #[test]
    fn test_classify() {
        let out = RemoteOutput::failed(1, "error: Failed to start domain\nerror: cannot allocate memory");
        assert!(matches!(classify("vm-1", &out), ControlError::CapacityExceeded { .. }));
        let out = RemoteOutput::failed(1, "error: failed to connect to the hypervisor");
        assert!(classify("vm-1", &out).is_transient());
    }
}
