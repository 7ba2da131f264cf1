//! # vdesk hypervisor
//!
//! Virtualization and block-storage control plane for vdesk.
//!
//! One [`HypervisorAdapter`] contract covers every backend family:
//! - **KVM** - libvirt through `virsh` over SSH
//! - **VMware** - vSphere Automation REST API over HTTPS
//! - **Hyper-V** - PowerShell remoting over WinRM
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────┐ ┌──────────────────────┐ ┌───────────────────┐
//!  │ VmLifecycleMgr   │ │ AttachmentManager    │ │ StorageLifecycle  │
//!  │ (per-VM locks)   │◄┤ (disk lock, VM lock) ├►│ (per-disk locks)  │
//!  └────────┬─────────┘ └──────────────────────┘ └─────────┬─────────┘
//!           │ HypervisorFactory                             │ StorageBackend
//!           ▼                                               ▼
//!  ┌─────────────────────────────────┐           ┌────────────────────┐
//!  │ KvmAdapter │ VmwareAdapter │ Hv │           │ Qcow2 │ Mock       │
//!  └───────────────┬─────────────────┘           └─────────┬──────────┘
//!                  ▼                                        ▼
//!  ┌───────────────────────────────────────────────────────────────────┐
//!  │ ConnectionRegistry (per-host semaphore, deadlines, credentials)   │
//!  └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vdesk_hypervisor::{LifecycleConfig, MockFactory, RecordTable, VmConfig, VmLifecycleManager};
//!
//! let manager = VmLifecycleManager::new(registry, Arc::new(MockFactory::new()),
//!     RecordTable::in_memory("vms"), LifecycleConfig::default());
//! let vm = manager.create_vm("host-1", VmConfig::new("desk-01").with_cpu(4)).await?;
//! manager.stop_vm(&vm.id, false).await?;
//! ```

pub mod attachment;
pub mod connection;
pub mod error;
pub mod factory;
pub mod hyperv;
pub mod kvm;
pub mod lifecycle;
pub mod locks;
pub mod mock;
pub mod retry;
pub mod storage;
pub mod store;
pub mod traits;
pub mod types;
pub mod vmware;

pub use attachment::{
    Attachment, AttachmentConfig, AttachmentIndex, AttachmentManager, AttachmentPhase,
    AttachmentState, NoAttachments,
};
pub use connection::{
    ConnectionRegistry, Credential, CredentialStore, HostHandle, RegistryConfig, RemoteExecutor,
    RemoteOutput, RemoteRequest, ScriptedExecutor, SystemExecutor,
};
pub use error::{ControlError, ErrorKind, Result};
pub use factory::{AdapterFactory, HypervisorFactory};
pub use hyperv::HyperVAdapter;
pub use kvm::KvmAdapter;
pub use lifecycle::{LifecycleConfig, VmLifecycleManager};
pub use mock::{MockAdapter, MockFactory, MockOp};
pub use retry::RetryPolicy;
pub use storage::{
    CreateDiskRequest, DiskStatus, DiskUpdate, MockStorageBackend, PrivateDataDisk, Qcow2Backend,
    Snapshot, SnapshotStatus, StorageBackend, StorageLifecycleManager, StorageOp,
};
pub use store::RecordTable;
pub use traits::{AdapterCapabilities, HypervisorAdapter};
pub use types::*;
pub use vmware::VmwareAdapter;
