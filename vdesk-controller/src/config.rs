//! Configuration management for the controller.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vdesk_hypervisor::{
    AttachmentConfig, Credential, HostRegistration, LifecycleConfig, RegistryConfig, RetryPolicy,
};

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST server configuration
    pub server: ServerConfig,
    /// Remote call and lifecycle tunables
    pub control: ControlConfig,
    /// Hosts registered at startup
    pub hosts: Vec<HostRegistration>,
    /// Named credential sets referenced by host descriptors
    pub credentials: BTreeMap<String, Credential>,
    /// Private data disk backend
    pub storage: StorageConfig,
    /// Directory for JSON record persistence (in-memory only if unset)
    pub state_dir: Option<PathBuf>,
    /// Permission matrix
    pub access: AccessConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config file")
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref state_dir) = args.state_dir {
            self.state_dir = Some(PathBuf::from(state_dir));
        }

        if args.dev {
            self.control.adapters = AdapterBackend::Mock;
            self.storage.backend = StorageBackendKind::Mock;
        }

        self
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for the REST API
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Which hypervisor adapters to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterBackend {
    /// Real adapters chosen by each host's virtualization tag
    #[default]
    Remote,
    /// In-memory adapters for development
    Mock,
}

/// Remote call and lifecycle tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub adapters: AdapterBackend,
    /// Retry policy for transient backend failures
    pub retry: RetryPolicy,
    /// Deadline for one remote call, queue wait included
    pub call_timeout_secs: u64,
    /// Concurrent remote calls per host when the host sets no limit
    pub default_concurrency: usize,
    /// Status polls while waiting for a new VM to run
    pub provisioning_poll_attempts: u32,
    pub provisioning_poll_interval_ms: u64,
    /// Allow attaching disks to stopped VMs
    pub allow_attach_to_stopped: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let lifecycle = LifecycleConfig::default();
        let registry = RegistryConfig::default();
        Self {
            adapters: AdapterBackend::default(),
            retry: RetryPolicy::default(),
            call_timeout_secs: registry.call_timeout.as_secs(),
            default_concurrency: registry.default_concurrency,
            provisioning_poll_attempts: lifecycle.provisioning_poll_attempts,
            provisioning_poll_interval_ms: lifecycle.provisioning_poll_interval_ms,
            allow_attach_to_stopped: AttachmentConfig::default().allow_stopped,
        }
    }
}

impl ControlConfig {
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            call_timeout: Duration::from_secs(self.call_timeout_secs.max(1)),
            default_concurrency: self.default_concurrency.max(1),
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            retry: self.retry.clone(),
            provisioning_poll_attempts: self.provisioning_poll_attempts,
            provisioning_poll_interval_ms: self.provisioning_poll_interval_ms,
        }
    }

    pub fn attachments(&self) -> AttachmentConfig {
        AttachmentConfig {
            allow_stopped: self.allow_attach_to_stopped,
        }
    }
}

/// Private data disk backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// In-memory volumes for testing/development
    #[default]
    Mock,
    /// qcow2 files managed with qemu-img on a storage host
    Qcow2,
}

/// Private data disk storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// Registered host holding the volumes (qcow2 backend)
    pub host_id: Option<String>,
    /// Volume directory on the storage host
    pub pool_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            host_id: None,
            pool_path: vdesk_hypervisor::storage::DEFAULT_POOL_PATH.to_string(),
        }
    }
}

/// Permission matrix configuration.
///
/// Each principal maps to permissions such as `STORAGE:READ`. `*` grants
/// everything; `STORAGE:*` grants every action on one resource.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Enforce the matrix; when false every authenticated principal is allowed
    pub enabled: bool,
    pub principals: BTreeMap<String, Vec<String>>,
}
