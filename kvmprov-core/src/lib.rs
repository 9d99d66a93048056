//! kvmprov Core Library
//!
//! Provisioning and decommissioning of KVM instances on a single libvirt
//! host: a compensating-transaction engine, a cloud-init seed image builder,
//! a copy-on-write disk cloner, a domain manager, and the orchestrator that
//! ties them to the instance database.

pub mod cloudinit;
pub mod config;
pub mod disk;
pub mod domain;
pub mod error;
pub mod hypervisor;
pub mod observability;
pub mod paths;
pub mod provision;
pub mod saga;
pub mod state;
pub mod types;

// Re-export commonly used items
pub use cloudinit::{CloudInitImage, MetaData, NetworkConfig, UserData};
pub use config::Config;
pub use disk::DiskCloner;
pub use domain::DomainManager;
pub use error::{ErrorKind, ProvisionError, Result};
pub use hypervisor::{Hypervisor, VirshHypervisor};
pub use observability::init as init_observability;
pub use paths::StorageLayout;
pub use provision::{CreateInstanceRequest, Provisioner, ReconcileReport, UpdateInstanceRequest};
pub use saga::{Rollback, Saga, SagaStep};
pub use state::{InstanceStore, StateManager};
pub use types::{
    DomainFilter, DomainSpec, DomainState, DomainUpdate, Instance, Network, OwnerId,
};
