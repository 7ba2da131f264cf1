//! Type definitions for compute hosts, VM configuration and VM records.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

// =============================================================================
// COMPUTE HOSTS
// =============================================================================

/// Virtualization backend family of a compute host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualizationType {
    /// libvirt/KVM, driven with `virsh` over SSH
    Kvm,
    /// vSphere/ESXi, driven through the REST automation API
    Vmware,
    /// Hyper-V, driven with PowerShell remoting over WinRM
    HyperV,
}

impl VirtualizationType {
    /// Parse a host's declared virtualization tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "kvm" | "libvirt" => Some(Self::Kvm),
            "vmware" | "vsphere" | "esxi" => Some(Self::Vmware),
            "hyperv" | "hyper-v" => Some(Self::HyperV),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Vmware => "vmware",
            Self::HyperV => "hyperv",
        }
    }
}

impl std::fmt::Display for VirtualizationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote-management transport used to reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ssh,
    Https,
    WinRm,
}

/// Protocol flags for a host connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportFlags {
    /// Use TLS (HTTPS / WinRM over HTTPS)
    pub tls: bool,
    /// Skip certificate and host key verification (lab setups only)
    pub insecure_skip_verify: bool,
}

/// How to reach and authenticate against a compute host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    /// Hostname or IP address
    pub address: String,
    /// Management port (22 for SSH, 443 for vSphere, 5986 for WinRM/TLS)
    pub port: u16,
    /// Name of the credential set in the credential store
    pub credential_ref: String,
    /// Transport used for remote calls
    pub transport: TransportKind,
    /// Transport flags
    #[serde(default)]
    pub flags: TransportFlags,
    /// Maximum concurrent remote calls to this host (registry default if unset)
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Backend-specific options (libvirt URI, datastore, virtual switch, ...)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionDescriptor {
    /// Create a descriptor with no flags or options.
    pub fn new(
        address: impl Into<String>,
        port: u16,
        credential_ref: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            credential_ref: credential_ref.into(),
            transport,
            flags: TransportFlags::default(),
            max_concurrency: None,
            options: BTreeMap::new(),
        }
    }

    /// Set a backend-specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up a backend-specific option, falling back to `default`.
    pub fn option_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.options.get(key).map(String::as_str).unwrap_or(default)
    }

    /// Check the descriptor's shape. `entity` names the host for errors.
    pub fn validate(&self, entity: &str) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(ControlError::validation(entity, "connection address is empty"));
        }
        if self.port == 0 {
            return Err(ControlError::validation(entity, "connection port must be non-zero"));
        }
        if self.credential_ref.trim().is_empty() {
            return Err(ControlError::validation(entity, "credential reference is empty"));
        }
        if self.max_concurrency == Some(0) {
            return Err(ControlError::validation(entity, "max_concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Last known reachability of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// A registered physical or virtualization host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeHost {
    pub id: String,
    /// Declared virtualization tag, resolved by the adapter factory
    pub virtualization_type: String,
    pub connection: ConnectionDescriptor,
    pub reachability: Reachability,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator request to register a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRegistration {
    /// Host id (generated if absent)
    #[serde(default)]
    pub id: Option<String>,
    pub virtualization_type: String,
    pub connection: ConnectionDescriptor,
}

// =============================================================================
// VM CONFIGURATION
// =============================================================================

/// Network placement carried inside a VM creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub vpc: Option<String>,
    pub subnet: Option<String>,
    /// Static IP address
    pub address: Option<String>,
    /// MAC address (aa:bb:cc:dd:ee:ff)
    pub mac: Option<String>,
}

/// VM configuration for creation. Not persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    #[serde(default)]
    pub gpu_count: Option<u32>,
    /// Image/version reference (backing image, template or parent disk)
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    /// Bootstrap payload handed to the guest (user-data, script)
    #[serde(default)]
    pub bootstrap: Option<String>,
}

impl VmConfig {
    /// Create a new VM configuration with small defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cpu_cores: 2,
            memory_gb: 4,
            storage_gb: 40,
            gpu_count: None,
            image: None,
            network: None,
            bootstrap: None,
        }
    }

    /// Set the number of CPU cores.
    pub fn with_cpu(mut self, cores: u32) -> Self {
        self.cpu_cores = cores;
        self
    }

    /// Set the memory size in GB.
    pub fn with_memory_gb(mut self, memory_gb: u32) -> Self {
        self.memory_gb = memory_gb;
        self
    }

    /// Set the root disk size in GB.
    pub fn with_storage_gb(mut self, storage_gb: u32) -> Self {
        self.storage_gb = storage_gb;
        self
    }

    pub fn with_gpus(mut self, count: u32) -> Self {
        self.gpu_count = Some(count);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_bootstrap(mut self, payload: impl Into<String>) -> Self {
        self.bootstrap = Some(payload.into());
        self
    }

    /// Number of GPUs requested (0 when unset).
    pub fn gpus(&self) -> u32 {
        self.gpu_count.unwrap_or(0)
    }

    /// Shape validation, independent of any backend.
    pub fn validate(&self) -> Result<()> {
        let entity = if self.name.is_empty() { "vm" } else { self.name.as_str() };

        if self.name.trim().is_empty() {
            return Err(ControlError::validation(entity, "name must not be empty"));
        }
        if self.name.len() > 63
            || !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ControlError::validation(
                entity,
                "name must be at most 63 characters of [A-Za-z0-9._-]",
            ));
        }
        if self.cpu_cores == 0 {
            return Err(ControlError::validation(entity, "cpuCores must be greater than 0"));
        }
        if self.memory_gb == 0 {
            return Err(ControlError::validation(entity, "memoryGb must be greater than 0"));
        }
        if self.storage_gb == 0 {
            return Err(ControlError::validation(entity, "storageGb must be greater than 0"));
        }
        if let Some(network) = &self.network {
            if let Some(address) = &network.address {
                address.parse::<IpAddr>().map_err(|_| {
                    ControlError::validation(entity, format!("invalid network address '{}'", address))
                })?;
            }
            if let Some(mac) = &network.mac {
                if !is_valid_mac(mac) {
                    return Err(ControlError::validation(
                        entity,
                        format!("invalid MAC address '{}'", mac),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Check a colon-separated MAC address.
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Generate a locally administered MAC address in the KVM/QEMU OUI.
pub fn generate_mac() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

// =============================================================================
// BACKEND-REPORTED VM STATE
// =============================================================================

/// Power state as reported by a hypervisor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Starting,
    Stopping,
    Unknown,
}

/// VM information returned by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    /// Backend-assigned identifier (libvirt UUID, vSphere MoRef, Hyper-V GUID)
    pub uuid: String,
    pub name: String,
    pub power_state: PowerState,
    pub address: Option<String>,
    pub mac: Option<String>,
}

/// Disk description handed to an adapter's device-attach primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachSpec {
    pub disk_id: String,
    /// Backend-visible source (file path, datastore path)
    pub source: String,
    /// Image format (qcow2, raw, vmdk, vhdx)
    pub format: String,
    /// Device name/slot; chosen by the adapter when absent on attach, required on detach
    pub device: Option<String>,
}

// =============================================================================
// CONTROL-PLANE VM RECORDS
// =============================================================================

/// Lifecycle state of a VM instance as recorded by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Requested,
    Provisioning,
    Running,
    Stopped,
    Restarting,
    Deleting,
    Deleted,
    Error,
}

impl VmState {
    /// Deleted is final; nothing may change it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Deleted)
    }

    /// Held only while an operation is running.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            VmState::Requested | VmState::Provisioning | VmState::Restarting | VmState::Deleting
        )
    }

    /// Authoritative lifecycle state for a backend power state, if definite.
    pub fn from_power(power: PowerState) -> Option<VmState> {
        match power {
            PowerState::Running => Some(VmState::Running),
            PowerState::Stopped => Some(VmState::Stopped),
            PowerState::Paused
            | PowerState::Starting
            | PowerState::Stopping
            | PowerState::Unknown => None,
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A VM instance managed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInstance {
    /// Control-plane id (stable even when creation fails)
    pub id: String,
    /// Backend uuid, assigned on successful creation
    pub uuid: Option<String>,
    pub name: String,
    pub state: VmState,
    pub host_id: String,
    pub address: Option<String>,
    pub mac: Option<String>,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmInstance {
    /// New record in `Requested` state for a validated config.
    pub fn requested(id: String, host_id: &str, config: &VmConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            uuid: None,
            name: config.name.clone(),
            state: VmState::Requested,
            host_id: host_id.to_string(),
            address: config.network.as_ref().and_then(|n| n.address.clone()),
            mac: config.network.as_ref().and_then(|n| n.mac.clone()),
            cpu_cores: config.cpu_cores,
            memory_gb: config.memory_gb,
            storage_gb: config.storage_gb,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `state`, refreshing the update timestamp.
    pub fn transition(&mut self, state: VmState) {
        self.state = state;
        self.updated_at = Utc::now();
        if state != VmState::Error {
            self.last_error = None;
        }
    }
}
