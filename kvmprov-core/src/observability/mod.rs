//! Observability infrastructure: tracing and metrics.
//!
//! Call [`init`] once at process startup before any provisioning operation.

use crate::config::Config;
use crate::error::{ProvisionError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize the global tracing subscriber and, when configured, the Prometheus exporter.
///
/// `RUST_LOG` takes precedence over `config.log_level`.
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| ProvisionError::InvalidConfig {
            reason: format!("Invalid log level '{}': {}", config.log_level, e),
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| ProvisionError::Internal(format!("Failed to install subscriber: {}", e)))?;

    if let Some(listen) = &config.metrics_listen {
        let addr: SocketAddr = listen.parse().map_err(|e| ProvisionError::InvalidConfig {
            reason: format!("Invalid metrics_listen '{}': {}", listen, e),
        })?;
        PrometheusBuilder::new().with_http_listener(addr).install().map_err(|e| {
            ProvisionError::Internal(format!("Failed to install metrics exporter: {}", e))
        })?;
        tracing::info!("Metrics exporter listening on {}", addr);
    }

    metrics::register_core_metrics();
    tracing::debug!("Observability initialized");
    Ok(())
}
