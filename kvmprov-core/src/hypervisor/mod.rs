//! Hypervisor control plane abstraction.
//!
//! kvmprov talks to a single local libvirt daemon. The [`Hypervisor`] trait
//! is the seam between domain management and the client that reaches the
//! daemon; [`VirshHypervisor`] is the production implementation.

use crate::error::Result;
use crate::types::{DomainFilter, DomainState};
use async_trait::async_trait;
use uuid::Uuid;

pub mod virsh;

pub use virsh::VirshHypervisor;

/// Operations kvmprov needs from the hypervisor.
///
/// Domains are addressed by UUID, which is also their name.
/// Implementations instrument their own methods.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Connection URI, e.g. `qemu:///system` (for logging).
    fn uri(&self) -> &str;

    /// Register (or replace) a persistent domain from its XML description.
    async fn define_xml(&self, xml: &str) -> Result<()>;

    /// Remove a domain definition. NotFound if it does not exist.
    async fn undefine(&self, id: &Uuid) -> Result<()>;

    /// Live XML description, or `None` if no such domain is defined.
    async fn dump_xml(&self, id: &Uuid) -> Result<Option<String>>;

    /// IDs of domains managed by kvmprov (those named by a UUID).
    async fn list_ids(&self, filter: DomainFilter) -> Result<Vec<Uuid>>;

    /// Runtime state. NotFound if the domain does not exist.
    async fn state(&self, id: &Uuid) -> Result<DomainState>;

    /// Boot a defined domain.
    async fn start(&self, id: &Uuid) -> Result<()>;

    /// Request a graceful (ACPI) shutdown and return immediately.
    async fn shutdown(&self, id: &Uuid) -> Result<()>;

    /// Force-stop a running domain.
    async fn destroy(&self, id: &Uuid) -> Result<()>;
}
