//! Adapter selection by virtualization type.

use std::sync::Arc;

use tracing::debug;

use crate::connection::ConnectionRegistry;
use crate::error::{ControlError, Result};
use crate::hyperv::HyperVAdapter;
use crate::kvm::KvmAdapter;
use crate::traits::HypervisorAdapter;
use crate::types::{ComputeHost, VirtualizationType};
use crate::vmware::VmwareAdapter;

/// Produces the adapter for a compute host.
pub trait AdapterFactory: Send + Sync {
    /// Adapter bound to `host`. Unknown virtualization tags fail with
    /// `UnsupportedHypervisorType`.
    fn adapter_for(&self, host: &ComputeHost) -> Result<Arc<dyn HypervisorAdapter>>;
}

/// Maps a host's virtualization tag to a real backend adapter bound to the
/// host's connection.
pub struct HypervisorFactory {
    registry: Arc<ConnectionRegistry>,
}

impl HypervisorFactory {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl AdapterFactory for HypervisorFactory {
    fn adapter_for(&self, host: &ComputeHost) -> Result<Arc<dyn HypervisorAdapter>> {
        let kind = VirtualizationType::from_tag(&host.virtualization_type).ok_or_else(|| {
            ControlError::UnsupportedHypervisorType {
                entity: host.id.clone(),
                tag: host.virtualization_type.clone(),
            }
        })?;
        let handle = self.registry.handle(&host.id)?;
        debug!(host_id = %host.id, kind = %kind, "Selected hypervisor adapter");

        let adapter: Arc<dyn HypervisorAdapter> = match kind {
            VirtualizationType::Kvm => Arc::new(KvmAdapter::new(handle)),
            VirtualizationType::Vmware => Arc::new(VmwareAdapter::new(handle)),
            VirtualizationType::HyperV => Arc::new(HyperVAdapter::new(handle)),
        };
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Credential, CredentialStore, RegistryConfig, ScriptedExecutor};
    use crate::store::RecordTable;
    use crate::types::{ConnectionDescriptor, HostRegistration, TransportKind};

    #[test]
    fn test_tag_selects_adapter_kind() {
        let credentials = Arc::new(CredentialStore::new());
        credentials.insert("c", Credential::password("admin", "pw"));
        let registry = Arc::new(ConnectionRegistry::new(
            RecordTable::in_memory("hosts"),
            credentials,
            Arc::new(ScriptedExecutor::new()),
            RegistryConfig::default(),
        ));

        for (id, tag, transport, expected) in [
            ("h-kvm", "kvm", TransportKind::Ssh, VirtualizationType::Kvm),
            ("h-vc", "vSphere", TransportKind::Https, VirtualizationType::Vmware),
            ("h-hv", "hyperv", TransportKind::WinRm, VirtualizationType::HyperV),
        ] {
            let host = registry
                .register_host(HostRegistration {
                    id: Some(id.into()),
                    virtualization_type: tag.into(),
                    connection: ConnectionDescriptor::new("10.0.0.1", 22, "c", transport),
                })
                .unwrap();
            let adapter = HypervisorFactory::new(registry.clone()).adapter_for(&host).unwrap();
            assert_eq!(adapter.kind(), expected);
            assert_eq!(adapter.host_id(), id);
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new(
            RecordTable::in_memory("hosts"),
            Arc::new(CredentialStore::new()),
            Arc::new(ScriptedExecutor::new()),
            RegistryConfig::default(),
        ));
        let now = chrono::Utc::now();
        let host = ComputeHost {
            id: "h-xen".into(),
            virtualization_type: "xen".into(),
            connection: ConnectionDescriptor::new("10.0.0.1", 22, "c", TransportKind::Ssh),
            reachability: Default::default(),
            registered_at: now,
            updated_at: now,
        };
        assert!(matches!(
            HypervisorFactory::new(registry).adapter_for(&host),
            Err(ControlError::UnsupportedHypervisorType { .. })
        ));
    }
}
