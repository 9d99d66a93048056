//! Instance provisioning orchestrator.
//!
//! [`Provisioner`] composes the database, the disk cloner, the cloud-init
//! builder and the domain manager into create/update/delete operations.
//!
//! Creation runs every external side effect as a saga step and commits the
//! database rows last; a failure anywhere unwinds the steps already taken.
//! Deletion runs the other way round: the rows are removed and committed
//! first, and only then is the domain torn down and its files removed.

pub mod reconcile;
pub mod steps;

use crate::cloudinit::{CloudInitImage, MetaData, NetworkConfig, UserData};
use crate::config::Config;
use crate::disk::{remove_if_exists, DiskCloner};
use crate::domain::DomainManager;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;
use crate::observability::metrics;
use crate::paths::StorageLayout;
use crate::saga::{Rollback, Saga};
use crate::state::InstanceStore;
use crate::types::{
    Cpu, DomainSpec, DomainState, DomainUpdate, Instance, InstanceChanges, Memory, NewInstance,
    NewNetwork, Os, OwnerId,
};
use std::sync::Arc;
use steps::{CloneDiskStep, DefineDomainStep, WriteCloudInitStep};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub use reconcile::ReconcileReport;

/// Step name recorded when the row inserts or the commit fail.
const PERSIST: &str = "persist";

/// Interface key of the guest NIC in generated network-config.
const PRIMARY_INTERFACE: &str = "primary";

/// Everything needed to provision one instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub owner_id: OwnerId,
    pub name: String,
    /// Operating system catalog name, e.g. `ubuntu`.
    pub os: String,
    /// Architecture catalog name, e.g. `x86_64`.
    pub arch: String,
    pub cpu_cores: u32,
    pub ram_mib: u32,
    pub storage_gib: u32,
    /// Guest login created by cloud-init.
    pub login: String,
    pub ssh_keys: Vec<String>,
    /// Crypt-style password hash for `login`; password login stays disabled when unset.
    pub password_hash: Option<String>,
    /// Static private address in CIDR notation. DHCP when unset.
    pub private_ip: Option<String>,
    pub gateway: Option<String>,
    pub nameservers: Vec<String>,
}

impl CreateInstanceRequest {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::invalid_input("instance name is required"));
        }
        if self.login.trim().is_empty() {
            return Err(ProvisionError::invalid_input("login is required"));
        }
        if self.ssh_keys.is_empty() && self.password_hash.is_none() {
            return Err(ProvisionError::invalid_input(
                "at least one SSH key or a password hash is required",
            ));
        }
        Ok(())
    }

    fn user_data(&self) -> UserData {
        let mut user_data =
            UserData::for_login(&self.login, self.ssh_keys.clone(), self.password_hash.clone());
        user_data.hostname = Some(self.name.clone());
        user_data
    }

    fn network_config(&self) -> NetworkConfig {
        match &self.private_ip {
            Some(address) => NetworkConfig::fixed(
                PRIMARY_INTERFACE,
                address.clone(),
                self.gateway.clone(),
                self.nameservers.clone(),
            ),
            None => NetworkConfig::dhcp(PRIMARY_INTERFACE),
        }
    }
}

/// Resource changes for an existing instance. Unset fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInstanceRequest {
    pub name: Option<String>,
    pub cpu_cores: Option<u32>,
    pub ram_mib: Option<u32>,
}

impl UpdateInstanceRequest {
    fn validate(&self) -> Result<()> {
        if self.name.is_none() && self.cpu_cores.is_none() && self.ram_mib.is_none() {
            return Err(ProvisionError::invalid_input("update changes nothing"));
        }
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(ProvisionError::invalid_input("instance name must not be empty"));
        }
        if self.cpu_cores == Some(0) {
            return Err(ProvisionError::invalid_input("cpu cores must be at least 1"));
        }
        if self.ram_mib == Some(0) {
            return Err(ProvisionError::invalid_input("ram must be at least 1 MiB"));
        }
        Ok(())
    }

    fn row_changes(&self) -> InstanceChanges {
        InstanceChanges { name: self.name.clone(), cpu_cores: self.cpu_cores, ram_mib: self.ram_mib }
    }

    fn domain_update(&self) -> DomainUpdate {
        DomainUpdate {
            name: self.name.clone(),
            memory: self.ram_mib.map(|mib| Memory::mib(u64::from(mib))),
            cpu_cores: self.cpu_cores,
        }
    }
}

/// Create/update/delete/start/stop use cases over one hypervisor host.
///
/// An `owner` of `None` skips the ownership check (administrative access).
pub struct Provisioner<S: InstanceStore> {
    store: Arc<S>,
    domains: DomainManager,
    cloner: DiskCloner,
    cloud_init: CloudInitImage,
}

impl<S: InstanceStore> Provisioner<S> {
    pub fn new(store: Arc<S>, domains: DomainManager, cloner: DiskCloner) -> Self {
        Self { store, domains, cloner, cloud_init: CloudInitImage::new() }
    }

    /// Wire a provisioner from configuration.
    pub fn from_config(config: &Config, store: Arc<S>, hypervisor: Arc<dyn Hypervisor>) -> Self {
        let domains = DomainManager::new(hypervisor, config.layout(), config.network.clone())
            .with_image_format(config.image_format.clone());
        let cloner = DiskCloner::new(&config.qemu_img_path, config.image_format.clone());
        Self::new(store, domains, cloner)
    }

    /// Replace the cloud-init image builder (e.g. to pin timestamps).
    pub fn with_cloud_init(mut self, builder: CloudInitImage) -> Self {
        self.cloud_init = builder;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn domains(&self) -> &DomainManager {
        &self.domains
    }

    pub fn layout(&self) -> &StorageLayout {
        self.domains.layout()
    }

    /// Provision a new instance.
    ///
    /// Clones the disk, writes the cloud-init ISO and defines the domain as
    /// saga steps, then inserts the Network and Instance rows in one
    /// transaction. Nothing is left behind when any of it fails.
    #[instrument(skip(self, request), fields(owner_id = request.owner_id, name = %request.name))]
    pub async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<Instance> {
        request.validate()?;

        let os = self.store.find_operating_system(&request.os).await?;
        let arch = self.store.find_architecture(&request.arch).await?;

        let id = Uuid::new_v4();
        let spec = DomainSpec {
            id,
            name: request.name.clone(),
            memory: Memory::mib(u64::from(request.ram_mib)),
            cpu: Cpu { cores: request.cpu_cores },
            os: Os::hvm(os.name.clone(), arch.name.clone()),
            storage_gib: request.storage_gib,
        };
        spec.validate()?;
        info!(instance_id = %id, "Provisioning instance");

        let layout = self.layout();
        let mut saga = Saga::new(format!("create-instance:{}", id));
        saga.add_step(CloneDiskStep::new(
            self.cloner.clone(),
            spec.base_image_path(layout),
            spec.vm_image_path(layout),
            spec.storage_gib,
        ))
        .add_step(WriteCloudInitStep::new(
            self.cloud_init.clone(),
            spec.cloudinit_iso_path(layout),
            request.user_data(),
            MetaData::new(id, request.name.clone()),
            Some(request.network_config()),
        ))
        .add_step(DefineDomainStep::new(self.domains.clone(), spec.clone()));

        if let Err(e) = saga.execute().await {
            metrics::record_create_failure(e.failed_step().unwrap_or("unknown"));
            error!(instance_id = %id, error = %e, "Instance provisioning failed");
            return Err(e);
        }

        let network = NewNetwork { id: Uuid::new_v4(), private_ip: request.private_ip.clone() };
        let fields = NewInstance {
            id,
            owner_id: request.owner_id,
            network_id: network.id,
            os_id: os.id,
            arch_id: arch.id,
            name: request.name.clone(),
            cpu_cores: request.cpu_cores,
            ram_mib: request.ram_mib,
            storage_gib: request.storage_gib,
        };

        match self.persist(&network, &fields).await {
            Ok(instance) => {
                metrics::record_instance_created();
                info!(instance_id = %id, "Instance provisioned");
                Ok(instance)
            }
            Err(e) => {
                metrics::record_create_failure(PERSIST);
                error!(instance_id = %id, error = %e, "Persisting instance failed, unwinding");
                let failed = saga.compensate().await;
                if failed > 0 {
                    return Err(ProvisionError::PartialFailure {
                        instance_id: id.to_string(),
                        reason: format!("{}; {} compensation(s) failed", e, failed),
                    });
                }
                Err(ProvisionError::step(PERSIST, e))
            }
        }
    }

    /// Insert the Network and Instance rows and commit.
    async fn persist(&self, network: &NewNetwork, fields: &NewInstance) -> Result<Instance> {
        let mut tx = self.store.begin().await?;
        let inserted = async {
            self.store.create_network(&mut tx, network).await?;
            self.store.create_instance(&mut tx, fields).await
        }
        .await;

        match inserted {
            Ok(instance) => {
                self.store.commit(tx).await?;
                Ok(instance)
            }
            Err(e) => {
                if let Err(rb) = self.store.rollback(tx).await {
                    warn!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Change name, CPU or RAM of an instance.
    ///
    /// The row update and the domain redefinition commit together: if the
    /// transaction cannot commit, the previous domain description is restored.
    /// Only after the commit is a running domain force-stopped; it stays
    /// stopped.
    #[instrument(skip(self, request), fields(instance_id = %id))]
    pub async fn update_instance(
        &self,
        id: &Uuid,
        owner: Option<OwnerId>,
        request: &UpdateInstanceRequest,
    ) -> Result<Instance> {
        request.validate()?;
        self.store.get_instance(id, owner).await?;
        let previous_xml = self.domains.dump_xml(id).await?;

        let mut tx = self.store.begin().await?;
        let updated =
            match self.store.update_instance(&mut tx, id, owner, &request.row_changes()).await {
                Ok(instance) => instance,
                Err(e) => {
                    self.rollback_quietly(tx).await;
                    return Err(e);
                }
            };

        let domains = self.domains.clone();
        let redefined = Rollback::run(
            "redefine-domain",
            self.domains.redefine(id, &request.domain_update()),
            move || async move { domains.restore_xml(&previous_xml).await },
        )
        .await;
        let mut guard = match redefined {
            Ok((_, guard)) => guard,
            Err(e) => {
                self.rollback_quietly(tx).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.commit(tx).await {
            if let Err(undo) = guard.rollback().await {
                return Err(ProvisionError::PartialFailure {
                    instance_id: id.to_string(),
                    reason: format!("{}; restoring domain failed: {}", e, undo),
                });
            }
            return Err(e);
        }
        guard.commit();

        if let Err(e) = self.domains.force_stop(id).await {
            return Err(ProvisionError::PartialFailure {
                instance_id: id.to_string(),
                reason: format!("update committed but stopping the domain failed: {}", e),
            });
        }

        info!(cpu_cores = updated.cpu_cores, ram_mib = updated.ram_mib, "Instance updated");
        Ok(updated)
    }

    /// Decommission an instance.
    ///
    /// The rows are deleted and committed before anything irreversible
    /// happens. Afterwards the domain is torn down (already absent is fine)
    /// and the disk clone and ISO are removed best-effort.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn delete_instance(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let deleted = async {
            let instance = self.store.delete_instance(&mut tx, id, owner).await?;
            self.store.delete_network(&mut tx, &instance.network_id).await?;
            Ok::<_, ProvisionError>(instance)
        }
        .await;
        if let Err(e) = deleted {
            self.rollback_quietly(tx).await;
            return Err(e);
        }
        self.store.commit(tx).await?;
        metrics::record_instance_deleted();
        info!("Instance rows deleted");

        match self.domains.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => info!("Domain already absent"),
            Err(e) => {
                error!(error = %e, "Domain teardown failed after commit");
                // Files stay while a domain may still reference them.
                return Err(ProvisionError::PartialFailure {
                    instance_id: id.to_string(),
                    reason: format!("domain teardown failed: {}", e),
                });
            }
        }

        let layout = self.layout();
        for path in [layout.vm_image_path(id), layout.cloudinit_iso_path(id)] {
            if let Err(e) = remove_if_exists(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove instance file");
            }
        }

        info!("Instance deleted");
        Ok(())
    }

    /// Boot the instance's domain after checking ownership.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn start_instance(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<()> {
        self.store.get_instance(id, owner).await?;
        self.domains.start(id).await
    }

    /// Request a graceful shutdown after checking ownership. Returns without waiting.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn stop_instance(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<()> {
        self.store.get_instance(id, owner).await?;
        self.domains.stop(id).await
    }

    pub async fn instance_state(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<DomainState> {
        self.store.get_instance(id, owner).await?;
        self.domains.state(id).await
    }

    pub async fn get_instance(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<Instance> {
        self.store.get_instance(id, owner).await
    }

    pub async fn list_instances(&self, owner: Option<OwnerId>) -> Result<Vec<Instance>> {
        self.store.list_instances(owner).await
    }

    async fn rollback_quietly(&self, tx: S::Tx) {
        if let Err(e) = self.store.rollback(tx).await {
            warn!(error = %e, "Rollback failed");
        }
    }
}
