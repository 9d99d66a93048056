//! Core domain types for kvmprov.

pub mod domain;
pub mod instance;

// Re-exports
pub use domain::{
    Cpu, DomainFilter, DomainSpec, DomainState, DomainUpdate, Memory, MemoryUnit, Os,
};
pub use instance::{
    Architecture, Instance, InstanceChanges, Network, NewInstance, NewNetwork, OperatingSystem,
    OwnerId,
};
