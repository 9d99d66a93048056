//! Shared fixtures for integration tests.
//!
//! Tests run against an in-memory database, a temporary storage layout and
//! an in-memory hypervisor, so no libvirt daemon or qemu-img is required.

#![allow(dead_code)]

use async_trait::async_trait;
use kvmprov_core::{
    domain::xml::DomainXml,
    error::{ProvisionError, Result},
    types::{
        Architecture, DomainFilter, DomainState, Instance, InstanceChanges, Network, NewInstance,
        NewNetwork, OperatingSystem, OwnerId,
    },
    CreateInstanceRequest, DiskCloner, DomainManager, Hypervisor, InstanceStore, Provisioner,
    StateManager, StorageLayout,
};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

pub const OS: &str = "ubuntu";
pub const ARCH: &str = "x86_64";
pub const OWNER: OwnerId = 42;

#[derive(Debug, Clone)]
struct MockDomain {
    xml: String,
    state: DomainState,
}

/// In-memory hypervisor with failure injection.
#[derive(Default)]
pub struct MockHypervisor {
    domains: Mutex<HashMap<Uuid, MockDomain>>,
    calls: Mutex<Vec<String>>,
    reject_define: AtomicBool,
    fail_destroy: AtomicBool,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent define fail as if libvirt rejected the XML.
    pub fn reject_define(&self, reject: bool) {
        self.reject_define.store(reject, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn is_defined(&self, id: &Uuid) -> bool {
        self.domains.lock().unwrap().contains_key(id)
    }

    pub fn domain_xml(&self, id: &Uuid) -> Option<DomainXml> {
        let xml = self.domains.lock().unwrap().get(id)?.xml.clone();
        Some(DomainXml::parse(&xml).unwrap())
    }

    pub fn domain_state(&self, id: &Uuid) -> Option<DomainState> {
        self.domains.lock().unwrap().get(id).map(|d| d.state)
    }

    pub fn set_state(&self, id: &Uuid, state: DomainState) {
        if let Some(domain) = self.domains.lock().unwrap().get_mut(id) {
            domain.state = state;
        }
    }

    pub fn domain_count(&self) -> usize {
        self.domains.lock().unwrap().len()
    }

    /// Operations performed so far, e.g. `"undefine <id>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn not_found(id: &Uuid) -> ProvisionError {
        ProvisionError::not_found("Domain", id)
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn uri(&self) -> &str {
        "test:///mock"
    }

    async fn define_xml(&self, xml: &str) -> Result<()> {
        let parsed = DomainXml::parse(xml)?;
        let id = Uuid::parse_str(&parsed.uuid).map_err(ProvisionError::internal)?;
        self.record(format!("define {}", id));
        if self.reject_define.load(Ordering::SeqCst) {
            return Err(ProvisionError::HypervisorRejected {
                operation: "define".to_string(),
                reason: "error: unsupported configuration".to_string(),
            });
        }

        let mut domains = self.domains.lock().unwrap();
        let state = domains.get(&id).map(|d| d.state).unwrap_or(DomainState::ShutOff);
        domains.insert(id, MockDomain { xml: xml.to_string(), state });
        Ok(())
    }

    async fn undefine(&self, id: &Uuid) -> Result<()> {
        self.record(format!("undefine {}", id));
        self.domains.lock().unwrap().remove(id).map(|_| ()).ok_or_else(|| Self::not_found(id))
    }

    async fn dump_xml(&self, id: &Uuid) -> Result<Option<String>> {
        Ok(self.domains.lock().unwrap().get(id).map(|d| d.xml.clone()))
    }

    async fn list_ids(&self, filter: DomainFilter) -> Result<Vec<Uuid>> {
        let domains = self.domains.lock().unwrap();
        Ok(domains
            .iter()
            .filter(|(_, d)| match filter {
                DomainFilter::All => true,
                DomainFilter::Active => d.state.is_active(),
                DomainFilter::Inactive => !d.state.is_active(),
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn state(&self, id: &Uuid) -> Result<DomainState> {
        self.domain_state(id).ok_or_else(|| Self::not_found(id))
    }

    async fn start(&self, id: &Uuid) -> Result<()> {
        self.record(format!("start {}", id));
        let mut domains = self.domains.lock().unwrap();
        let domain = domains.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        domain.state = DomainState::Running;
        Ok(())
    }

    async fn shutdown(&self, id: &Uuid) -> Result<()> {
        self.record(format!("shutdown {}", id));
        let mut domains = self.domains.lock().unwrap();
        let domain = domains.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        domain.state = DomainState::ShuttingDown;
        Ok(())
    }

    async fn destroy(&self, id: &Uuid) -> Result<()> {
        self.record(format!("destroy {}", id));
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(ProvisionError::HypervisorRejected {
                operation: "destroy".to_string(),
                reason: "error: Failed to terminate process".to_string(),
            });
        }
        let mut domains = self.domains.lock().unwrap();
        let domain = domains.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        domain.state = DomainState::ShutOff;
        Ok(())
    }
}

/// [`StateManager`] whose commits can be made to fail.
///
/// A failed commit rolls the transaction back, as a real commit failure would.
pub struct FailingCommitStore {
    inner: StateManager,
    fail_commit: AtomicBool,
}

impl FailingCommitStore {
    pub fn new(inner: StateManager) -> Self {
        Self { inner, fail_commit: AtomicBool::new(false) }
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }
}

type Tx = <StateManager as InstanceStore>::Tx;

#[async_trait]
impl InstanceStore for FailingCommitStore {
    type Tx = Tx;

    async fn begin(&self) -> Result<Tx> {
        self.inner.begin().await
    }

    async fn commit(&self, tx: Tx) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            self.inner.rollback(tx).await?;
            return Err(ProvisionError::Database("commit: disk I/O error".to_string()));
        }
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: Tx) -> Result<()> {
        self.inner.rollback(tx).await
    }

    async fn create_network(&self, tx: &mut Tx, fields: &NewNetwork) -> Result<Network> {
        self.inner.create_network(tx, fields).await
    }

    async fn create_instance(&self, tx: &mut Tx, fields: &NewInstance) -> Result<Instance> {
        self.inner.create_instance(tx, fields).await
    }

    async fn update_instance(
        &self,
        tx: &mut Tx,
        id: &Uuid,
        owner: Option<OwnerId>,
        changes: &InstanceChanges,
    ) -> Result<Instance> {
        self.inner.update_instance(tx, id, owner, changes).await
    }

    async fn delete_instance(
        &self,
        tx: &mut Tx,
        id: &Uuid,
        owner: Option<OwnerId>,
    ) -> Result<Instance> {
        self.inner.delete_instance(tx, id, owner).await
    }

    async fn delete_network(&self, tx: &mut Tx, id: &Uuid) -> Result<()> {
        self.inner.delete_network(tx, id).await
    }

    async fn get_instance(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<Instance> {
        self.inner.get_instance(id, owner).await
    }

    async fn list_instances(&self, owner: Option<OwnerId>) -> Result<Vec<Instance>> {
        self.inner.list_instances(owner).await
    }

    async fn find_operating_system(&self, name: &str) -> Result<OperatingSystem> {
        self.inner.find_operating_system(name).await
    }

    async fn find_architecture(&self, name: &str) -> Result<Architecture> {
        self.inner.find_architecture(name).await
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stand-in for qemu-img that creates the clone file (second-to-last argument).
pub fn fake_qemu_img(dir: &Path) -> PathBuf {
    write_script(dir, "fake-qemu-img", "while [ $# -gt 2 ]; do shift; done\ntouch \"$1\"")
}

/// Stand-in for qemu-img that fails with a diagnostic on stderr.
pub fn broken_qemu_img(dir: &Path) -> PathBuf {
    write_script(dir, "broken-qemu-img", "echo \"qemu-img: Could not open backing file\" >&2\nexit 1")
}

/// Temporary host: storage layout with one base image, catalog rows and a mock hypervisor.
pub struct TestHost {
    pub dir: TempDir,
    pub layout: StorageLayout,
    pub hypervisor: Arc<MockHypervisor>,
    pub state: StateManager,
    tool: PathBuf,
}

impl TestHost {
    pub async fn new() -> Self {
        Self::with_tool(fake_qemu_img).await
    }

    /// Host whose clone utility is built by `tool` inside the temp directory.
    pub async fn with_tool(tool: impl FnOnce(&Path) -> PathBuf) -> Self {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::under(dir.path().join("storage"));
        let base = layout.base_image_path(OS, ARCH);
        std::fs::create_dir_all(base.parent().unwrap()).unwrap();
        std::fs::write(&base, b"base image").unwrap();

        let state = StateManager::new_in_memory().await.unwrap();
        state.insert_operating_system(OS).await.unwrap();
        state.insert_architecture(ARCH).await.unwrap();

        let tool = tool(dir.path());
        Self { dir, layout, hypervisor: Arc::new(MockHypervisor::new()), state, tool }
    }

    pub fn domains(&self) -> DomainManager {
        DomainManager::new(self.hypervisor.clone(), self.layout.clone(), "default")
    }

    pub fn provisioner(&self) -> Provisioner<StateManager> {
        self.provisioner_with(Arc::new(self.state.clone()))
    }

    pub fn provisioner_with<S: InstanceStore>(&self, store: Arc<S>) -> Provisioner<S> {
        Provisioner::new(store, self.domains(), DiskCloner::new(&self.tool, "qcow2"))
    }

    /// Provisioner over a store whose commits can be made to fail.
    pub fn failing_provisioner(&self) -> (Arc<FailingCommitStore>, Provisioner<FailingCommitStore>) {
        let store = Arc::new(FailingCommitStore::new(self.state.clone()));
        (store.clone(), self.provisioner_with(store))
    }

    pub fn vm_image(&self, id: &Uuid) -> PathBuf {
        self.layout.vm_image_path(id)
    }

    pub fn cloudinit_iso(&self, id: &Uuid) -> PathBuf {
        self.layout.cloudinit_iso_path(id)
    }

    /// Regular files under the clone and ISO directories.
    pub fn instance_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in [&self.layout.vm_image_dir, &self.layout.cloudinit_dir] {
            if let Ok(entries) = std::fs::read_dir(dir) {
                files.extend(entries.map(|e| e.unwrap().path()));
            }
        }
        files
    }
}

/// Scenario 1 request: ubuntu/x86_64, 2 cores, 2048 MiB, 20 GiB.
pub fn create_request(name: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        owner_id: OWNER,
        name: name.to_string(),
        os: OS.to_string(),
        arch: ARCH.to_string(),
        cpu_cores: 2,
        ram_mib: 2048,
        storage_gib: 20,
        login: "ops".to_string(),
        ssh_keys: vec!["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ ops@example".to_string()],
        password_hash: None,
        private_ip: None,
        gateway: None,
        nameservers: Vec::new(),
    }
}
