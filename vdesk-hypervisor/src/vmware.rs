//! VMware adapter.
//!
//! Talks to the vSphere Automation REST API (`/api/vcenter/...`) with a
//! session token obtained from `/api/session`. The VM uuid is the vSphere
//! managed object id (e.g. `vm-42`). Descriptor options:
//!
//! - `folder`, `resource_pool`, `datastore`: placement for new VMs
//! - `network`: port group for the primary NIC
//! - `guest_os`: guest OS identifier (default `OTHER_LINUX_64`)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::connection::{HostHandle, HttpAuth, HttpMethod, RemoteOutput, RemoteRequest};
use crate::error::{ControlError, Result};
use crate::traits::{reachability_outcome, AdapterCapabilities, HypervisorAdapter};
use crate::types::{DiskAttachSpec, PowerState, VirtualizationType, VmConfig, VmInfo};

const SESSION_PATH: &str = "/api/session";
const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error_type: Option<String>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    default_message: String,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct NicInfo {
    mac_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmDetails {
    name: String,
    power_state: String,
    #[serde(default)]
    nics: HashMap<String, NicInfo>,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiskSummary {
    disk: String,
}

#[derive(Debug, Deserialize)]
struct DiskDetails {
    backing: DiskBacking,
}

#[derive(Debug, Deserialize)]
struct DiskBacking {
    vmdk_file: Option<String>,
}

/// vSphere adapter bound to one vCenter or ESXi host.
pub struct VmwareAdapter {
    host: HostHandle,
    shutdown_poll_interval: Duration,
    shutdown_poll_attempts: u32,
}

impl VmwareAdapter {
    pub fn new(host: HostHandle) -> Self {
        Self {
            host,
            shutdown_poll_interval: Duration::from_secs(2),
            shutdown_poll_attempts: 15,
        }
    }

    pub fn with_shutdown_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.shutdown_poll_interval = interval;
        self.shutdown_poll_attempts = attempts;
        self
    }

    fn auth() -> HttpAuth {
        HttpAuth::Session {
            login_path: SESSION_PATH.to_string(),
            header: SESSION_HEADER.to_string(),
        }
    }

    async fn call(&self, method: HttpMethod, path: &str, body: Option<Value>) -> Result<RemoteOutput> {
        let mut request = RemoteRequest::http(method, path, Self::auth());
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.host.run(request).await
    }

    /// Call the API and fail on a non-2xx status.
    async fn call_ok(&self, entity: &str, method: HttpMethod, path: &str, body: Option<Value>) -> Result<RemoteOutput> {
        let output = self.call(method, path, body).await?;
        if output.http_success() {
            Ok(output)
        } else {
            Err(classify(entity, &output))
        }
    }

    /// Issue a power action, treating "already in desired state" as success.
    async fn power_action(&self, uuid: &str, path: &str) -> Result<()> {
        let output = self.call(HttpMethod::Post, path, None).await?;
        if output.http_success() || error_type(&output).as_deref() == Some("ALREADY_IN_DESIRED_STATE") {
            Ok(())
        } else {
            Err(classify(uuid, &output))
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let output = self
            .call_ok(name, HttpMethod::Get, &format!("/api/vcenter/vm?names={}", name), None)
            .await?;
        let vms: Vec<VmSummary> = output.json(name)?;
        Ok(vms.into_iter().next().map(|v| v.vm))
    }

    fn placement(&self) -> Value {
        let desc = self.host.descriptor();
        let mut placement = serde_json::Map::new();
        for key in ["folder", "resource_pool", "datastore"] {
            if let Some(value) = desc.options.get(key) {
                placement.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        Value::Object(placement)
    }

    fn create_body(&self, config: &VmConfig) -> Value {
        let desc = self.host.descriptor();
        let mut nic = json!({
            "start_connected": true,
            "backing": {
                "type": "STANDARD_PORTGROUP",
                "network": desc.option_or("network", "network-1"),
            },
        });
        if let Some(mac) = config.network.as_ref().and_then(|n| n.mac.as_ref()) {
            nic["mac_type"] = json!("MANUAL");
            nic["mac_address"] = json!(mac);
        }

        json!({
            "name": config.name,
            "guest_OS": desc.option_or("guest_os", "OTHER_LINUX_64"),
            "placement": self.placement(),
            "cpu": { "count": config.cpu_cores },
            "memory": { "size_MiB": u64::from(config.memory_gb) * 1024 },
            "disks": [
                { "new_vmdk": { "capacity": u64::from(config.storage_gb) * 1024 * 1024 * 1024 } }
            ],
            "nics": [nic],
        })
    }

    async fn find_disk_by_backing(&self, uuid: &str, source: &str) -> Result<Option<String>> {
        let base = format!("/api/vcenter/vm/{}/hardware/disk", uuid);
        let disks: Vec<DiskSummary> = self.call_ok(uuid, HttpMethod::Get, &base, None).await?.json(uuid)?;
        for disk in disks {
            let details: DiskDetails = self
                .call_ok(uuid, HttpMethod::Get, &format!("{}/{}", base, disk.disk), None)
                .await?
                .json(uuid)?;
            if details.backing.vmdk_file.as_deref() == Some(source) {
                return Ok(Some(disk.disk));
            }
        }
        Ok(None)
    }
}

fn error_type(output: &RemoteOutput) -> Option<String> {
    serde_json::from_str::<ApiErrorBody>(&output.stdout)
        .ok()
        .and_then(|b| b.error_type)
}

/// Map a failed API response to the error taxonomy.
fn classify(entity: &str, output: &RemoteOutput) -> ControlError {
    let body = serde_json::from_str::<ApiErrorBody>(&output.stdout).ok();
    let kind = body.as_ref().and_then(|b| b.error_type.clone()).unwrap_or_default();
    let message = body
        .as_ref()
        .and_then(|b| b.messages.first())
        .map(|m| m.default_message.clone())
        .unwrap_or_else(|| format!("HTTP {}", output.status));

    match (kind.as_str(), output.status) {
        ("NOT_FOUND", _) | (_, 404) => ControlError::not_found(entity),
        ("INVALID_ARGUMENT", _) | (_, 400) => ControlError::validation(entity, message),
        ("UNABLE_TO_ALLOCATE_RESOURCE", _) => ControlError::capacity(entity, message),
        ("NOT_ALLOWED_IN_CURRENT_STATE", _) | ("RESOURCE_BUSY", _) => ControlError::invalid_state(entity, message),
        ("ALREADY_EXISTS", _) => ControlError::conflict(entity, message),
        ("UNSUPPORTED", _) => ControlError::unsupported(entity, message),
        ("SERVICE_UNAVAILABLE", _) | ("UNAUTHENTICATED", _) | (_, 401) | (_, 503) => {
            ControlError::unavailable(entity, message)
        }
        (_, status) if status >= 500 => ControlError::unavailable(entity, message),
        _ => ControlError::internal(entity, message),
    }
}

fn parse_power_state(state: &str) -> PowerState {
    match state {
        "POWERED_ON" => PowerState::Running,
        "POWERED_OFF" => PowerState::Stopped,
        "SUSPENDED" => PowerState::Paused,
        _ => PowerState::Unknown,
    }
}

#[async_trait]
impl HypervisorAdapter for VmwareAdapter {
    fn kind(&self) -> VirtualizationType {
        VirtualizationType::Vmware
    }

    fn host_id(&self) -> &str {
        self.host.host_id()
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            name: "vSphere".to_string(),
            max_vcpus: 768,
            max_memory_gb: 24576,
            max_gpus: 0,
            supports_hotplug: true,
            supports_bootstrap: false,
            disk_formats: vec!["vmdk".to_string()],
        }
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn test_connection(&self) -> Result<bool> {
        let result = self.call(HttpMethod::Get, "/api/appliance/system/version", None).await;
        reachability_outcome(self.host.host_id(), result, |o| o.http_success())
    }

    #[instrument(skip(self, config), fields(host_id = %self.host.host_id(), vm_name = %config.name))]
    async fn create_vm(&self, config: &VmConfig) -> Result<VmInfo> {
        self.capabilities().check(config)?;
        let name = config.name.as_str();

        let uuid = match self.find_by_name(name).await? {
            Some(existing) => {
                info!(uuid = %existing, "VM already exists, resuming creation");
                existing
            }
            None => {
                let output = match &config.image {
                    Some(template) => {
                        let body = json!({
                            "source": template,
                            "name": name,
                            "placement": self.placement(),
                            "power_on": false,
                        });
                        self.call_ok(name, HttpMethod::Post, "/api/vcenter/vm?action=clone", Some(body)).await?
                    }
                    None => {
                        self.call_ok(name, HttpMethod::Post, "/api/vcenter/vm", Some(self.create_body(config)))
                            .await?
                    }
                };
                let uuid: String = output.json(name)?;
                info!(uuid = %uuid, "VM created");
                uuid
            }
        };

        self.start_vm(&uuid).await?;
        let mut vm = self.get_vm_info(&uuid).await?;
        if vm.address.is_none() {
            vm.address = config.network.as_ref().and_then(|n| n.address.clone());
        }
        Ok(vm)
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn start_vm(&self, uuid: &str) -> Result<()> {
        self.power_action(uuid, &format!("/api/vcenter/vm/{}/power?action=start", uuid)).await?;
        info!("VM powered on");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn stop_vm(&self, uuid: &str, force: bool) -> Result<()> {
        if self.get_vm_status(uuid).await? == PowerState::Stopped {
            debug!("VM already powered off");
            return Ok(());
        }

        if !force {
            let output = self
                .call(HttpMethod::Post, &format!("/api/vcenter/vm/{}/guest/power?action=shutdown", uuid), None)
                .await?;
            if output.http_success() {
                for _ in 0..self.shutdown_poll_attempts {
                    tokio::time::sleep(self.shutdown_poll_interval).await;
                    if self.get_vm_status(uuid).await? == PowerState::Stopped {
                        info!("Guest shut down gracefully");
                        return Ok(());
                    }
                }
                warn!("Guest shutdown timed out, powering off");
            } else {
                // Usually means VMware Tools is not running in the guest
                debug!(status = output.status, "Guest shutdown unavailable, powering off");
            }
        }

        self.power_action(uuid, &format!("/api/vcenter/vm/{}/power?action=stop", uuid)).await?;
        info!("VM powered off");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn restart_vm(&self, uuid: &str) -> Result<()> {
        let state = self.get_vm_status(uuid).await?;
        if state != PowerState::Running {
            return Err(ControlError::invalid_state(
                uuid,
                format!("cannot restart a VM that is {:?}", state),
            ));
        }
        self.call_ok(uuid, HttpMethod::Post, &format!("/api/vcenter/vm/{}/power?action=reset", uuid), None)
            .await?;
        info!("VM reset");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn delete_vm(&self, uuid: &str) -> Result<()> {
        let state = self.get_vm_status(uuid).await?;
        if state != PowerState::Stopped {
            return Err(ControlError::invalid_state(
                uuid,
                format!("cannot delete a VM that is {:?}", state),
            ));
        }
        self.call_ok(uuid, HttpMethod::Delete, &format!("/api/vcenter/vm/{}", uuid), None)
            .await?;
        info!("VM deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn get_vm_info(&self, uuid: &str) -> Result<VmInfo> {
        let details: VmDetails = self
            .call_ok(uuid, HttpMethod::Get, &format!("/api/vcenter/vm/{}", uuid), None)
            .await?
            .json(uuid)?;
        let power_state = parse_power_state(&details.power_state);

        let address = if power_state == PowerState::Running {
            let output = self
                .call(HttpMethod::Get, &format!("/api/vcenter/vm/{}/guest/identity", uuid), None)
                .await?;
            if output.http_success() {
                output.json::<GuestIdentity>(uuid).ok().and_then(|g| g.ip_address)
            } else {
                None
            }
        } else {
            None
        };

        // NIC keys are device ids; the lowest is the primary adapter
        let mut nics: Vec<(String, NicInfo)> = details.nics.into_iter().collect();
        nics.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(VmInfo {
            uuid: uuid.to_string(),
            name: details.name,
            power_state,
            address,
            mac: nics.into_iter().find_map(|(_, nic)| nic.mac_address),
        })
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>> {
        match self.find_by_name(name).await? {
            Some(uuid) => self.get_vm_info(&uuid).await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_vm_status(&self, uuid: &str) -> Result<PowerState> {
        let power: PowerInfo = self
            .call_ok(uuid, HttpMethod::Get, &format!("/api/vcenter/vm/{}/power", uuid), None)
            .await?
            .json(uuid)?;
        Ok(parse_power_state(&power.state))
    }

    #[instrument(skip(self, spec), fields(host_id = %self.host.host_id(), disk_id = %spec.disk_id))]
    async fn attach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<String> {
        self.capabilities().check_disk_format(&spec.disk_id, &spec.format)?;
        if let Some(existing) = self.find_disk_by_backing(uuid, &spec.source).await? {
            debug!(device = %existing, "Disk already attached");
            return Ok(existing);
        }

        let body = json!({
            "type": "SCSI",
            "backing": { "type": "VMDK_FILE", "vmdk_file": spec.source },
        });
        let device: String = self
            .call_ok(&spec.disk_id, HttpMethod::Post, &format!("/api/vcenter/vm/{}/hardware/disk", uuid), Some(body))
            .await?
            .json(&spec.disk_id)?;

        info!(device = %device, "Disk attached");
        Ok(device)
    }

    #[instrument(skip(self, spec), fields(host_id = %self.host.host_id(), disk_id = %spec.disk_id))]
    async fn detach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<()> {
        let device = match &spec.device {
            Some(device) => device.clone(),
            None => self
                .find_disk_by_backing(uuid, &spec.source)
                .await?
                .ok_or_else(|| ControlError::not_found(&spec.disk_id))?,
        };
        self.call_ok(
            &spec.disk_id,
            HttpMethod::Delete,
            &format!("/api/vcenter/vm/{}/hardware/disk/{}", uuid, device),
            None,
        )
        .await?;
        info!(device = %device, "Disk detached");
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

    fn adapter() -> (VmwareAdapter, Arc<ScriptedExecutor>) {
        let executor = Arc::new(ScriptedExecutor::new());
        let credentials = Arc::new(CredentialStore::new());
        credentials.insert("vc", Credential::password("administrator@vsphere.local", "secret"));
        let registry = Arc::new(ConnectionRegistry::new(
            RecordTable::in_memory("hosts"),
            credentials,
            executor.clone(),
            RegistryConfig::default(),
        ));
        let mut desc = ConnectionDescriptor::new("vc.lab", 443, "vc", TransportKind::Https)
            .with_option("datastore", "datastore-11")
            .with_option("network", "network-7");
        desc.flags.tls = true;
        registry
            .register_host(HostRegistration {
                id: Some("vc-1".into()),
                virtualization_type: "vmware".into(),
                connection: desc,
            })
            .unwrap();
        let adapter = VmwareAdapter::new(registry.handle("vc-1").unwrap())
            .with_shutdown_poll(Duration::from_millis(1), 2);
        (adapter, executor)
    }

    #[tokio::test]
    async fn test_create_posts_spec_and_powers_on() {
        let (adapter, exec) = adapter();
        exec.respond("GET /api/vcenter/vm?names=desk-01", RemoteOutput::http(200, "[]"));
        exec.respond("POST /api/vcenter/vm", RemoteOutput::http(201, r#""vm-42""#));
        exec.respond(
            "GET /api/vcenter/vm/vm-42",
            RemoteOutput::http(
                200,
                r#"{"name":"desk-01","power_state":"POWERED_ON","nics":{"4000":{"mac_address":"00:50:56:aa:bb:cc"}}}"#,
            ),
        );
        exec.respond("GET /api/vcenter/vm/vm-42/guest/identity", RemoteOutput::http(200, r#"{"ip_address":"10.1.2.3"}"#));

        let vm = adapter.create_vm(&VmConfig::new("desk-01").with_memory_gb(8)).await.unwrap();
        assert_eq!(vm.uuid, "vm-42");
        assert_eq!(vm.power_state, PowerState::Running);
        assert_eq!(vm.mac.as_deref(), Some("00:50:56:aa:bb:cc"));
        assert_eq!(vm.address.as_deref(), Some("10.1.2.3"));

        let (_, create) = exec
            .requests()
            .into_iter()
            .find(|(_, r)| r.describe() == "POST /api/vcenter/vm")
            .unwrap();
        match create {
            RemoteRequest::Http { body: Some(body), .. } => {
                assert_eq!(body["memory"]["size_MiB"], 8192);
                assert_eq!(body["placement"]["datastore"], "datastore-11");
                assert_eq!(body["nics"][0]["backing"]["network"], "network-7");
            }
            other => panic!("unexpected request: {:?}", other),
        }
        assert_eq!(exec.count("POST /api/vcenter/vm/vm-42/power?action=start"), 1);
    }

    #[tokio::test]
    async fn test_power_actions_tolerate_desired_state() {
        let (adapter, exec) = adapter();
        exec.respond(
            "power?action=start",
            RemoteOutput::http(400, r#"{"error_type":"ALREADY_IN_DESIRED_STATE","messages":[]}"#),
        );
        adapter.start_vm("vm-42").await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_stop_without_tools_powers_off() {
        let (adapter, exec) = adapter();
        exec.respond("GET /api/vcenter/vm/vm-42/power", RemoteOutput::http(200, r#"{"state":"POWERED_ON"}"#));
        exec.respond(
            "guest/power?action=shutdown",
            RemoteOutput::http(503, r#"{"error_type":"SERVICE_UNAVAILABLE","messages":[{"default_message":"Tools not running"}]}"#),
        );
        adapter.stop_vm("vm-42", false).await.unwrap();
        assert_eq!(exec.count("power?action=stop"), 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (adapter, exec) = adapter();
        exec.respond(
            "GET /api/vcenter/vm/vm-404/power",
            RemoteOutput::http(404, r#"{"error_type":"NOT_FOUND","messages":[]}"#),
        );
        assert!(matches!(adapter.get_vm_status("vm-404").await, Err(ControlError::NotFound { .. })));

        let out = RemoteOutput::http(
            400,
            r#"{"error_type":"UNABLE_TO_ALLOCATE_RESOURCE","messages":[{"default_message":"Insufficient memory"}]}"#,
        );
        assert!(matches!(classify("vm-1", &out), ControlError::CapacityExceeded { .. }));
        assert!(classify("vm-1", &RemoteOutput::http(502, "")).is_transient());
    }

    #[tokio::test]
    async fn test_delete_requires_powered_off() {
        let (adapter, exec) = adapter();
        exec.respond("GET /api/vcenter/vm/vm-42/power", RemoteOutput::http(200, r#"{"state":"POWERED_ON"}"#));
        assert!(matches!(adapter.delete_vm("vm-42").await, Err(ControlError::InvalidState { .. })));
        assert_eq!(exec.count("DELETE"), 0);
    }

    #[tokio::test]
    async fn test_attach_returns_disk_id() {
        let (adapter, exec) = adapter();
        exec.respond("GET /api/vcenter/vm/vm-42/hardware/disk", RemoteOutput::http(200, "[]"));
        exec.respond("POST /api/vcenter/vm/vm-42/hardware/disk", RemoteOutput::http(201, r#""2001""#));

        let spec = DiskAttachSpec {
            disk_id: "disk-1".into(),
            source: "[datastore1] vdesk/disk-1.vmdk".into(),
            format: "vmdk".into(),
            device: None,
        };
        assert_eq!(adapter.attach_disk("vm-42", &spec).await.unwrap(), "2001");
    }

    #[tokio::test]
    async fn test_attach_rejects_qcow2_backing() {
        let (adapter, exec) = adapter();
        let spec = DiskAttachSpec {
            disk_id: "disk-1".into(),
            source: "/var/lib/vdesk/disks/disk-1.qcow2".into(),
            format: "qcow2".into(),
            device: None,
        };
        assert!(matches!(
            adapter.attach_disk("vm-42", &spec).await,
            Err(ControlError::UnsupportedOperation { .. })
        ));
        assert_eq!(exec.count("hardware/disk"), 0);
    }
}
