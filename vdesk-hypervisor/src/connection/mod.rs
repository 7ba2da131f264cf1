//! Connection registry for compute hosts.
//!
//! The registry owns host records and hands out rate-limited remote
//! execution. Each host gets a fair semaphore sized by its descriptor's
//! `max_concurrency` (or the registry default); callers beyond the limit
//! queue. Every call carries a deadline covering both the queue wait and the
//! call itself. On expiry the caller gets `Timeout` while the call keeps
//! running on its own task and releases its permit when it finishes.

mod credentials;
mod executor;
mod scripted;

pub use credentials::{Credential, CredentialStore};
pub use executor::{
    HttpAuth, HttpMethod, RemoteExecutor, RemoteOutput, RemoteRequest, RemoteTarget,
    SystemExecutor,
};
pub(crate) use executor::{first_line, ps_quote};
pub use scripted::ScriptedExecutor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{ControlError, Result};
use crate::store::RecordTable;
use crate::types::{
    ComputeHost, ConnectionDescriptor, HostRegistration, Reachability, VirtualizationType,
};

/// Registry-wide limits.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Deadline for one remote call, queue wait included
    pub call_timeout: Duration,
    /// Concurrency limit for hosts that do not set their own
    pub default_concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            default_concurrency: 4,
        }
    }
}

/// Per-host connection configuration and pooled remote execution.
pub struct ConnectionRegistry {
    hosts: RecordTable<ComputeHost>,
    limiters: Mutex<HashMap<String, Arc<Semaphore>>>,
    credentials: Arc<CredentialStore>,
    executor: Arc<dyn RemoteExecutor>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(
        hosts: RecordTable<ComputeHost>,
        credentials: Arc<CredentialStore>,
        executor: Arc<dyn RemoteExecutor>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            hosts,
            limiters: Mutex::new(HashMap::new()),
            credentials,
            executor,
            config,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Register a compute host.
    ///
    /// The virtualization tag must name a supported backend and the
    /// credential reference must resolve.
    #[instrument(skip(self, registration), fields(host_id))]
    pub fn register_host(&self, registration: HostRegistration) -> Result<ComputeHost> {
        let id = registration
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("host-{}", uuid::Uuid::new_v4()));
        tracing::Span::current().record("host_id", id.as_str());

        if VirtualizationType::from_tag(&registration.virtualization_type).is_none() {
            return Err(ControlError::UnsupportedHypervisorType {
                entity: id,
                tag: registration.virtualization_type,
            });
        }
        self.check_descriptor(&id, &registration.connection)?;

        let now = Utc::now();
        let host = ComputeHost {
            id: id.clone(),
            virtualization_type: registration.virtualization_type.trim().to_lowercase(),
            connection: registration.connection,
            reachability: Reachability::Unknown,
            registered_at: now,
            updated_at: now,
        };
        self.hosts.insert(&id, host.clone())?;

        info!(
            host_id = %id,
            virtualization_type = %host.virtualization_type,
            address = %host.connection.address,
            "Compute host registered"
        );
        Ok(host)
    }

    /// Replace a host's connection descriptor.
    #[instrument(skip(self, descriptor))]
    pub async fn update_connection(
        &self,
        host_id: &str,
        descriptor: ConnectionDescriptor,
    ) -> Result<ComputeHost> {
        self.check_descriptor(host_id, &descriptor)?;
        let host = self.hosts.update(host_id, |h| {
            h.connection = descriptor;
            h.reachability = Reachability::Unknown;
            h.updated_at = Utc::now();
        })?;

        // Calls in flight keep their permits on the old limiter
        self.limiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(host_id);
        self.executor.invalidate(host_id).await;

        info!(host_id = %host_id, "Host connection updated");
        Ok(host)
    }

    fn check_descriptor(&self, host_id: &str, descriptor: &ConnectionDescriptor) -> Result<()> {
        descriptor.validate(host_id)?;
        if !self.credentials.contains(&descriptor.credential_ref) {
            return Err(ControlError::validation(
                host_id,
                format!("unknown credential reference '{}'", descriptor.credential_ref),
            ));
        }
        Ok(())
    }

    pub fn get_host(&self, host_id: &str) -> Result<ComputeHost> {
        self.hosts.require(host_id)
    }

    pub fn list_hosts(&self) -> Vec<ComputeHost> {
        self.hosts.list()
    }

    /// Record the outcome of a reachability check.
    pub fn set_reachability(&self, host_id: &str, reachability: Reachability) -> Result<ComputeHost> {
        let host = self.hosts.update(host_id, |h| {
            h.reachability = reachability;
            h.updated_at = Utc::now();
        })?;
        debug!(host_id = %host_id, ?reachability, "Host reachability updated");
        Ok(host)
    }

    /// Remove a host record. Callers check for referencing VMs first.
    pub(crate) fn remove_host(&self, host_id: &str) -> Result<()> {
        self.hosts
            .remove(host_id)?
            .ok_or_else(|| ControlError::not_found(host_id))?;
        self.limiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(host_id);
        info!(host_id = %host_id, "Compute host removed");
        Ok(())
    }

    /// Bind a handle to one host for adapters.
    pub fn handle(self: &Arc<Self>, host_id: &str) -> Result<HostHandle> {
        let host = self.get_host(host_id)?;
        Ok(HostHandle {
            host_id: host.id,
            descriptor: host.connection,
            registry: self.clone(),
        })
    }

    fn limiter(&self, host: &ComputeHost) -> Arc<Semaphore> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(host.id.clone())
            .or_insert_with(|| {
                let permits = host
                    .connection
                    .max_concurrency
                    .unwrap_or(self.config.default_concurrency)
                    .max(1);
                Arc::new(Semaphore::new(permits))
            })
            .clone()
    }

    /// Run one remote call against a host, queueing behind the host's
    /// concurrency limit.
    #[instrument(skip(self, request), fields(request = %request.describe()))]
    pub async fn execute(&self, host_id: &str, request: RemoteRequest) -> Result<RemoteOutput> {
        let host = self.get_host(host_id)?;
        let credential = self.credentials.resolve(&host.connection.credential_ref)?;
        let limiter = self.limiter(&host);
        let deadline = Instant::now() + self.config.call_timeout;
        let timeout_ms = self.config.call_timeout.as_millis() as u64;
        let timed_out = || ControlError::Timeout {
            entity: host_id.to_string(),
            timeout_ms,
        };

        let permit = match tokio::time::timeout_at(deadline, limiter.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ControlError::internal(host_id, "host limiter closed")),
            Err(_) => {
                warn!(host_id = %host_id, timeout_ms, "Timed out waiting for a host connection slot");
                return Err(timed_out());
            }
        };

        let target = RemoteTarget {
            host_id: host.id.clone(),
            descriptor: host.connection,
            credential,
        };
        let executor = self.executor.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            executor.execute(&target, request).await
        });

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ControlError::internal(host_id, format!("remote call task failed: {}", e))),
            Err(_) => {
                warn!(host_id = %host_id, timeout_ms, "Remote call exceeded its deadline, leaving it to finish detached");
                Err(timed_out())
            }
        }
    }
}

/// A host's connection, bound for use by one adapter.
#[derive(Clone)]
pub struct HostHandle {
    host_id: String,
    descriptor: ConnectionDescriptor,
    registry: Arc<ConnectionRegistry>,
}

impl HostHandle {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Run a request through the registry.
    pub async fn run(&self, request: RemoteRequest) -> Result<RemoteOutput> {
        self.registry.execute(&self.host_id, request).await
    }
}
