//! Hypervisor-facing domain types.

use crate::error::{ProvisionError, Result};
use crate::paths::StorageLayout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Transient description of a virtual machine, derivable from the
/// hypervisor's live domain description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    /// Instance ID, also the domain name and UUID
    pub id: Uuid,

    /// Human-readable instance name
    pub name: String,

    pub memory: Memory,

    pub cpu: Cpu,

    pub os: Os,

    /// Disk size in GiB
    pub storage_gib: u32,
}

impl DomainSpec {
    /// Read-only base image the clone is backed by.
    pub fn base_image_path(&self, layout: &StorageLayout) -> PathBuf {
        layout.base_image_path(&self.os.name, &self.os.arch)
    }

    /// Writable clone attached as the domain's disk.
    pub fn vm_image_path(&self, layout: &StorageLayout) -> PathBuf {
        layout.vm_image_path(&self.id)
    }

    /// Cloud-init ISO attached as the domain's cdrom.
    pub fn cloudinit_iso_path(&self, layout: &StorageLayout) -> PathBuf {
        layout.cloudinit_iso_path(&self.id)
    }

    /// Reject specs the hypervisor could never accept.
    pub fn validate(&self) -> Result<()> {
        if self.cpu.cores == 0 {
            return Err(ProvisionError::invalid_input("cpu cores must be at least 1"));
        }
        if self.memory.to_mib() == 0 {
            return Err(ProvisionError::invalid_input("memory must be at least 1 MiB"));
        }
        if self.storage_gib == 0 {
            return Err(ProvisionError::invalid_input("storage must be at least 1 GiB"));
        }
        if self.os.name.is_empty() || self.os.arch.is_empty() {
            return Err(ProvisionError::invalid_input("os name and architecture are required"));
        }
        Ok(())
    }

    /// Apply the provided fields of `update`, leaving the rest untouched.
    pub fn apply(&mut self, update: &DomainUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(memory) = update.memory {
            self.memory = memory;
        }
        if let Some(cores) = update.cpu_cores {
            self.cpu.cores = cores;
        }
    }
}

/// Memory allocation with an explicit unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub value: u64,
    pub unit: MemoryUnit,
}

impl Memory {
    pub fn mib(value: u64) -> Self {
        Self { value, unit: MemoryUnit::MiB }
    }

    /// Size in MiB, rounded down.
    pub fn to_mib(&self) -> u64 {
        self.value.saturating_mul(self.unit.bytes()) / MemoryUnit::MiB.bytes()
    }

    /// The same amount expressed in MiB.
    pub fn normalized(&self) -> Self {
        Self::mib(self.to_mib())
    }
}

/// Memory units as spelled in libvirt domain descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryUnit {
    #[serde(rename = "b", alias = "bytes")]
    B,
    #[serde(rename = "KiB", alias = "k")]
    KiB,
    #[serde(rename = "MiB", alias = "M")]
    MiB,
    #[serde(rename = "GiB", alias = "G")]
    GiB,
    #[serde(rename = "TiB", alias = "T")]
    TiB,
}

impl MemoryUnit {
    fn bytes(self) -> u64 {
        match self {
            Self::B => 1,
            Self::KiB => 1 << 10,
            Self::MiB => 1 << 20,
            Self::GiB => 1 << 30,
            Self::TiB => 1 << 40,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::B => "b",
            Self::KiB => "KiB",
            Self::MiB => "MiB",
            Self::GiB => "GiB",
            Self::TiB => "TiB",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "b" | "bytes" => Some(Self::B),
            "KiB" | "k" | "K" => Some(Self::KiB),
            "MiB" | "M" => Some(Self::MiB),
            "GiB" | "G" => Some(Self::GiB),
            "TiB" | "T" => Some(Self::TiB),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    pub cores: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Os {
    /// Catalog name, e.g. `ubuntu`
    pub name: String,

    /// Guest ABI, `hvm` for full virtualization
    pub os_type: String,

    /// CPU architecture, e.g. `x86_64`
    pub arch: String,
}

impl Os {
    pub fn hvm(name: impl Into<String>, arch: impl Into<String>) -> Self {
        Self { name: name.into(), os_type: "hvm".to_string(), arch: arch.into() }
    }
}

/// Partial spec for `DomainManager::update`: only `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainUpdate {
    pub name: Option<String>,
    pub memory: Option<Memory>,
    pub cpu_cores: Option<u32>,
}

impl DomainUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.memory.is_none() && self.cpu_cores.is_none()
    }
}

/// Which domains `list` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainFilter {
    #[default]
    All,
    Active,
    Inactive,
}

/// Runtime state of a defined domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    Other,
}

impl DomainState {
    /// Whether the domain holds a running guest that must be stopped before removal.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::ShuttingDown)
    }

    /// Parse `virsh domstate` output.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "running" | "idle" => Self::Running,
            "paused" | "pmsuspended" => Self::Paused,
            "in shutdown" => Self::ShuttingDown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::ShuttingDown => write!(f, "in shutdown"),
            Self::ShutOff => write!(f, "shut off"),
            Self::Crashed => write!(f, "crashed"),
            Self::Other => write!(f, "unknown"),
        }
    }
}
