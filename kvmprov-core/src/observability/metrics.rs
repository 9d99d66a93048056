//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Instance lifecycle
    describe_counter!("kvmprov_instances_created_total", "Total number of instances provisioned");
    describe_counter!(
        "kvmprov_instance_create_failures_total",
        "Total number of failed instance creations (by failing step)"
    );
    describe_counter!("kvmprov_instances_deleted_total", "Total number of instances decommissioned");

    // Saga
    describe_counter!(
        "kvmprov_saga_compensations_total",
        "Compensations attempted while unwinding a saga (by step, outcome)"
    );

    // Disk
    describe_histogram!(
        "kvmprov_disk_clone_duration_seconds",
        "Time taken by the disk image utility to create a clone"
    );

    // Dependencies
    describe_counter!("kvmprov_db_errors_total", "Database failures (by operation)");
    describe_counter!("kvmprov_hypervisor_errors_total", "Hypervisor call failures (by operation)");
}

pub fn record_instance_created() {
    counter!("kvmprov_instances_created_total").increment(1);
}

pub fn record_create_failure(step: &str) {
    counter!("kvmprov_instance_create_failures_total", "step" => step.to_string()).increment(1);
}

pub fn record_instance_deleted() {
    counter!("kvmprov_instances_deleted_total").increment(1);
}

pub fn record_compensation(step: &str, succeeded: bool) {
    let outcome = if succeeded { "ok" } else { "failed" };
    counter!("kvmprov_saga_compensations_total", "step" => step.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_clone_duration(duration_secs: f64) {
    histogram!("kvmprov_disk_clone_duration_seconds").record(duration_secs);
}

pub fn record_db_error(operation: &'static str) {
    counter!("kvmprov_db_errors_total", "operation" => operation).increment(1);
}

pub fn record_hypervisor_error(operation: &'static str) {
    counter!("kvmprov_hypervisor_errors_total", "operation" => operation).increment(1);
}
