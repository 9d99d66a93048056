//! In-process client: wires the provisioner from configuration.

use anyhow::{Context, Result};
use kvmprov_core::{Config, Provisioner, StateManager, VirshHypervisor};
use std::path::Path;
use std::sync::Arc;

/// Provisioner over the local SQLite database and libvirt daemon.
pub struct KvmprovClient {
    pub state: StateManager,
    pub provisioner: Provisioner<StateManager>,
}

impl KvmprovClient {
    /// Load configuration (from `config_path` if given), initialize logging,
    /// open the database and connect the hypervisor lazily.
    pub async fn connect(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
        .context("Failed to load configuration")?;

        kvmprov_core::init_observability(&config).context("Failed to initialize logging")?;

        let state = StateManager::new(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path))?;
        let hypervisor = Arc::new(VirshHypervisor::from_config(&config));
        let provisioner = Provisioner::from_config(&config, Arc::new(state.clone()), hypervisor);

        Ok(Self { state, provisioner })
    }
}
