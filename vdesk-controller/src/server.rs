//! Controller assembly and lifecycle.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use vdesk_hypervisor::{
    AdapterFactory, AttachmentManager, ConnectionRegistry, CredentialStore, HypervisorFactory,
    MockFactory, MockStorageBackend, Qcow2Backend, RecordTable, StorageBackend,
    StorageLifecycleManager, SystemExecutor, VmLifecycleManager,
};

use crate::access::{AccessGate, AllowAll, StaticPermissionMatrix};
use crate::config::{AdapterBackend, Config, StorageBackendKind};
use crate::http_server::{run_http_server, AppState};

/// Upper bound on establishing one remote connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a record table, persisted when a state directory is configured.
fn open_table<T>(name: &'static str, state_dir: Option<&Path>) -> Result<RecordTable<T>>
where
    T: Clone + Serialize + DeserializeOwned,
{
    match state_dir {
        Some(dir) => RecordTable::persistent(name, dir)
            .with_context(|| format!("Failed to load {} records from {}", name, dir.display())),
        None => Ok(RecordTable::in_memory(name)),
    }
}

/// Wire the registry, managers and access gate from configuration.
pub fn build_state(config: &Config) -> Result<Arc<AppState>> {
    let state_dir = config.state_dir.as_deref();
    match state_dir {
        Some(dir) => info!(state_dir = %dir.display(), "Persisting records"),
        None => warn!("No state directory configured, records are kept in memory only"),
    }

    let credentials = Arc::new(CredentialStore::new());
    for (name, credential) in &config.credentials {
        credentials.insert(name.clone(), credential.clone());
    }

    let registry_config = config.control.registry();
    let executor = SystemExecutor::new(CONNECT_TIMEOUT.min(registry_config.call_timeout))
        .context("Failed to create remote executor")?;

    let registry = Arc::new(ConnectionRegistry::new(
        open_table("hosts", state_dir)?,
        credentials,
        Arc::new(executor),
        registry_config,
    ));

    for registration in &config.hosts {
        if let Some(id) = registration.id.as_deref() {
            if registry.get_host(id).is_ok() {
                info!(host_id = %id, "Host already registered, keeping stored record");
                continue;
            }
        }
        let host = registry
            .register_host(registration.clone())
            .with_context(|| format!("Failed to register host at {}", registration.connection.address))?;
        info!(host_id = %host.id, virtualization_type = %host.virtualization_type, "Host loaded from configuration");
    }

    let factory: Arc<dyn AdapterFactory> = match config.control.adapters {
        AdapterBackend::Mock => {
            warn!("Using mock hypervisor adapters");
            Arc::new(MockFactory::new())
        }
        AdapterBackend::Remote => Arc::new(HypervisorFactory::new(registry.clone())),
    };

    let backend: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageBackendKind::Mock => {
            warn!("Using mock storage backend");
            Arc::new(MockStorageBackend::new())
        }
        StorageBackendKind::Qcow2 => {
            let host_id = config
                .storage
                .host_id
                .as_deref()
                .context("storage.host_id is required for the qcow2 backend")?;
            let handle = registry
                .handle(host_id)
                .with_context(|| format!("Storage host {} is not usable", host_id))?;
            info!(host_id = %host_id, pool = %config.storage.pool_path, "Using qcow2 storage backend");
            Arc::new(Qcow2Backend::new(handle, config.storage.pool_path.clone()))
        }
    };

    let vms = Arc::new(VmLifecycleManager::new(
        registry.clone(),
        factory,
        open_table("vms", state_dir)?,
        config.control.lifecycle(),
    ));
    let storage = Arc::new(StorageLifecycleManager::new(
        backend,
        open_table("disks", state_dir)?,
        open_table("snapshots", state_dir)?,
        config.control.retry.clone(),
    ));
    let attachments = Arc::new(AttachmentManager::new(
        vms.clone(),
        storage.clone(),
        open_table("attachments", state_dir)?,
        config.control.attachments(),
    ));

    let access: Arc<dyn AccessGate> = if config.access.enabled {
        Arc::new(StaticPermissionMatrix::from_config(&config.access)?)
    } else {
        warn!("Access control disabled, every principal may perform every action");
        Arc::new(AllowAll)
    };

    Ok(Arc::new(AppState {
        registry,
        vms,
        storage,
        attachments,
        access,
    }))
}

/// Run the controller until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.server.listen_address))?;

    let state = build_state(&config)?;
    info!(
        hosts = state.registry.list_hosts().len(),
        vms = state.vms.list_vms(None).len(),
        disks = state.storage.list_disks(None).len(),
        "Controller state ready"
    );

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    };

    run_http_server(addr, state, shutdown).await?;

    info!("Controller stopped");
    Ok(())
}
