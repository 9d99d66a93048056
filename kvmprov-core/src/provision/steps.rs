//! Saga steps registered by instance creation.
//!
//! Each step owns everything it needs so the saga can hold it as a boxed
//! trait object; undo actions tolerate the artifact already being gone.

use crate::cloudinit::{CloudInitImage, MetaData, NetworkConfig, UserData};
use crate::disk::{remove_if_exists, DiskCloner};
use crate::domain::DomainManager;
use crate::error::{ProvisionError, Result};
use crate::saga::SagaStep;
use crate::types::DomainSpec;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CLONE_DISK: &str = "clone-disk";
pub const WRITE_CLOUD_INIT: &str = "write-cloud-init";
pub const DEFINE_DOMAIN: &str = "define-domain";

/// Copy-on-write clone of the base image; undo deletes the clone.
pub struct CloneDiskStep {
    cloner: DiskCloner,
    base: PathBuf,
    clone: PathBuf,
    size_gib: u32,
}

impl CloneDiskStep {
    pub fn new(cloner: DiskCloner, base: PathBuf, clone: PathBuf, size_gib: u32) -> Self {
        Self { cloner, base, clone, size_gib }
    }
}

#[async_trait]
impl SagaStep for CloneDiskStep {
    fn name(&self) -> &str {
        CLONE_DISK
    }

    async fn execute(&self) -> Result<()> {
        self.cloner.clone_image(&self.base, &self.clone, self.size_gib).await
    }

    async fn compensate(&self) -> Result<()> {
        self.cloner.remove_clone(&self.clone).await
    }
}

/// Seed ISO with the instance's cloud-init documents; undo deletes the ISO.
pub struct WriteCloudInitStep {
    builder: CloudInitImage,
    path: PathBuf,
    user_data: UserData,
    meta_data: MetaData,
    network_config: Option<NetworkConfig>,
}

impl WriteCloudInitStep {
    pub fn new(
        builder: CloudInitImage,
        path: PathBuf,
        user_data: UserData,
        meta_data: MetaData,
        network_config: Option<NetworkConfig>,
    ) -> Self {
        Self { builder, path, user_data, meta_data, network_config }
    }
}

#[async_trait]
impl SagaStep for WriteCloudInitStep {
    fn name(&self) -> &str {
        WRITE_CLOUD_INIT
    }

    async fn execute(&self) -> Result<()> {
        let image =
            self.builder.build(&self.user_data, &self.meta_data, self.network_config.as_ref())?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| ProvisionError::io(dir, e))?;
        }

        // The ISO only appears at its final path once fully written.
        let staging = staging_path(&self.path);
        let written = match tokio::fs::write(&staging, &image).await {
            Ok(()) => tokio::fs::rename(&staging, &self.path)
                .await
                .map_err(|e| ProvisionError::io(&self.path, e)),
            Err(e) => Err(ProvisionError::io(&staging, e)),
        };
        if let Err(e) = written {
            if let Err(cleanup) = remove_if_exists(&staging).await {
                warn!(error = %cleanup, "Failed to remove staged cloud-init ISO");
            }
            return Err(e);
        }

        debug!(path = %self.path.display(), bytes = image.len(), "Cloud-init ISO written");
        Ok(())
    }

    async fn compensate(&self) -> Result<()> {
        remove_if_exists(&self.path).await
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Domain definition; undo removes the definition again.
pub struct DefineDomainStep {
    domains: DomainManager,
    spec: DomainSpec,
}

impl DefineDomainStep {
    pub fn new(domains: DomainManager, spec: DomainSpec) -> Self {
        Self { domains, spec }
    }
}

#[async_trait]
impl SagaStep for DefineDomainStep {
    fn name(&self) -> &str {
        DEFINE_DOMAIN
    }

    async fn execute(&self) -> Result<()> {
        self.domains.create(&self.spec).await
    }

    async fn compensate(&self) -> Result<()> {
        match self.domains.delete(&self.spec.id).await {
            Err(e) if e.is_not_found() => {
                info!(domain_id = %self.spec.id, "Domain already gone");
                Ok(())
            }
            other => other,
        }
    }
}
