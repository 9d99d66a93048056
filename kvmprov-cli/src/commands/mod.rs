//! CLI command implementations

pub mod catalog;
pub mod instances;
pub mod reconcile;

pub use reconcile::reconcile;
