//! Durable records: instances, their networks, and the OS/architecture catalog.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Account that owns instances. Accounts themselves live outside this crate.
pub type OwnerId = i64;

/// A provisioned virtual machine.
///
/// `id` is assigned once at creation and is the join key across the DB row,
/// the cloned disk, the cloud-init ISO and the hypervisor domain UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub network_id: Uuid,
    pub os_id: i64,
    pub arch_id: i64,
    pub name: String,
    pub cpu_cores: u32,
    /// RAM in MiB
    pub ram_mib: u32,
    /// Storage in GiB
    pub storage_gib: u32,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Private network attachment of an instance (1:1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: Uuid,
    /// Static private address in CIDR notation, or `None` for DHCP.
    pub private_ip: Option<String>,
    pub created_at: SystemTime,
}

/// Fields for inserting an instance row.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub network_id: Uuid,
    pub os_id: i64,
    pub arch_id: i64,
    pub name: String,
    pub cpu_cores: u32,
    pub ram_mib: u32,
    pub storage_gib: u32,
}

/// Fields for inserting a network row.
#[derive(Debug, Clone)]
pub struct NewNetwork {
    pub id: Uuid,
    pub private_ip: Option<String>,
}

/// Resource fields an update may change on an instance row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceChanges {
    pub name: Option<String>,
    pub cpu_cores: Option<u32>,
    pub ram_mib: Option<u32>,
}

impl InstanceChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.cpu_cores.is_none() && self.ram_mib.is_none()
    }
}

/// Operating system catalog entry, e.g. `ubuntu`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingSystem {
    pub id: i64,
    pub name: String,
}

/// CPU architecture catalog entry, e.g. `x86_64`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub id: i64,
    pub name: String,
}
