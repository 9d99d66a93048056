//! Virtual-machine domains on the hypervisor.
//!
//! [`DomainManager`] translates between [`DomainSpec`] and libvirt domain
//! XML and drives the domain lifecycle through a shared [`Hypervisor`].
//! It never creates or deletes backing files; sequencing those is the
//! provisioner's job.

pub mod xml;

use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;
use crate::paths::StorageLayout;
use crate::types::{DomainFilter, DomainSpec, DomainState, DomainUpdate};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use xml::DomainXml;

const DEFAULT_IMAGE_FORMAT: &str = "qcow2";

/// Domain operations against one hypervisor connection.
#[derive(Clone)]
pub struct DomainManager {
    hypervisor: Arc<dyn Hypervisor>,
    layout: StorageLayout,
    network: String,
    image_format: String,
}

impl DomainManager {
    /// `network` is the libvirt network new NICs are attached to. Disks are
    /// declared as qcow2 unless [`with_image_format`](Self::with_image_format)
    /// says otherwise.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        layout: StorageLayout,
        network: impl Into<String>,
    ) -> Self {
        Self {
            hypervisor,
            layout,
            network: network.into(),
            image_format: DEFAULT_IMAGE_FORMAT.to_string(),
        }
    }

    /// Format of the VM images, as passed to the disk cloner.
    pub fn with_image_format(mut self, format: impl Into<String>) -> Self {
        self.image_format = format.into();
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Reconstruct the spec of a defined domain.
    #[instrument(skip(self), fields(domain_id = %id))]
    pub async fn get(&self, id: &Uuid) -> Result<DomainSpec> {
        self.describe(id).await?.to_spec()
    }

    /// Specs of every kvmprov domain matching `filter`.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: DomainFilter) -> Result<Vec<DomainSpec>> {
        let ids = self.hypervisor.list_ids(filter).await?;
        let mut specs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(spec) => specs.push(spec),
                // Undefined between list and describe.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(specs)
    }

    /// Define (but do not start) a domain for `spec`.
    ///
    /// The VM image and the cloud-init ISO must already exist.
    #[instrument(skip(self, spec), fields(domain_id = %spec.id))]
    pub async fn create(&self, spec: &DomainSpec) -> Result<()> {
        spec.validate()?;
        require_file(&spec.vm_image_path(&self.layout), "VM image").await?;
        require_file(&spec.cloudinit_iso_path(&self.layout), "cloud-init ISO").await?;

        let xml = self.describe_new(spec).to_xml()?;
        self.hypervisor.define_xml(&xml).await?;

        info!(vcpus = spec.cpu.cores, memory_mib = spec.memory.to_mib(), "Domain defined");
        Ok(())
    }

    /// Apply the provided fields and redefine the domain.
    ///
    /// There is no live update: a running domain is force-stopped after the
    /// redefinition and left stopped.
    #[instrument(skip(self), fields(domain_id = %id))]
    pub async fn update(&self, id: &Uuid, update: &DomainUpdate) -> Result<DomainSpec> {
        let spec = self.redefine(id, update).await?;
        self.force_stop(id).await?;
        info!(vcpus = spec.cpu.cores, memory_mib = spec.memory.to_mib(), "Domain updated");
        Ok(spec)
    }

    /// Redefine the domain with `update` applied, leaving its run state alone.
    ///
    /// The new definition takes effect on the next boot.
    #[instrument(skip(self), fields(domain_id = %id))]
    pub async fn redefine(&self, id: &Uuid, update: &DomainUpdate) -> Result<DomainSpec> {
        let live = self.describe(id).await?;
        let mut spec = live.to_spec()?;
        spec.apply(update);
        spec.validate()?;

        let mut next = self.describe_new(&spec);
        if let Some(mac) = live.primary_mac() {
            next.set_primary_mac(mac);
        }
        self.hypervisor.define_xml(&next.to_xml()?).await?;
        debug!("Domain redefined");
        Ok(spec)
    }

    /// Power off the domain if it is active. Returns whether it was.
    #[instrument(skip(self), fields(domain_id = %id))]
    pub async fn force_stop(&self, id: &Uuid) -> Result<bool> {
        if !self.hypervisor.state(id).await?.is_active() {
            return Ok(false);
        }
        warn!("Forcing stop of running domain");
        self.hypervisor.destroy(id).await?;
        Ok(true)
    }

    /// Stop the domain if active, then remove its definition.
    ///
    /// Backing files are left in place.
    #[instrument(skip(self), fields(domain_id = %id))]
    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        if self.hypervisor.state(id).await?.is_active() {
            debug!("Stopping active domain before undefine");
            self.hypervisor.destroy(id).await?;
        }
        self.hypervisor.undefine(id).await?;
        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self), fields(domain_id = %id))]
    pub async fn start(&self, id: &Uuid) -> Result<()> {
        self.hypervisor.start(id).await?;
        info!("Domain started");
        Ok(())
    }

    /// Request a graceful shutdown. Does not wait for the guest to power off.
    #[instrument(skip(self), fields(domain_id = %id))]
    pub async fn stop(&self, id: &Uuid) -> Result<()> {
        self.hypervisor.shutdown(id).await?;
        info!("Domain shutdown requested");
        Ok(())
    }

    pub async fn state(&self, id: &Uuid) -> Result<DomainState> {
        self.hypervisor.state(id).await
    }

    /// Current XML description, verbatim.
    pub async fn dump_xml(&self, id: &Uuid) -> Result<String> {
        self.hypervisor.dump_xml(id).await?.ok_or_else(|| ProvisionError::not_found("Domain", id))
    }

    /// Re-register a description captured earlier with [`dump_xml`](Self::dump_xml).
    pub async fn restore_xml(&self, xml: &str) -> Result<()> {
        self.hypervisor.define_xml(xml).await
    }

    fn describe_new(&self, spec: &DomainSpec) -> DomainXml {
        DomainXml::from_spec(spec, &self.layout, &self.network, &self.image_format)
    }

    async fn describe(&self, id: &Uuid) -> Result<DomainXml> {
        DomainXml::parse(&self.dump_xml(id).await?)
    }
}

async fn require_file(path: &Path, what: &str) -> Result<()> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ProvisionError::invalid_input(format!(
            "{} {} does not exist",
            what,
            path.display()
        ))),
        Err(e) => Err(ProvisionError::io(path, e)),
    }
}
