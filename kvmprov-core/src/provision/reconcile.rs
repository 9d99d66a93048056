//! Reconciliation sweep between the database and the host.
//!
//! Instance rows are the source of truth. Domains and files whose ID has no
//! row are leftovers of interrupted deletions or crashed creations and are
//! removed; rows whose domain is gone are only reported.

use super::Provisioner;
use crate::disk::remove_if_exists;
use crate::error::{ProvisionError, Result};
use crate::paths::StorageLayout;
use crate::state::InstanceStore;
use crate::types::DomainFilter;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use uuid::Uuid;

type IdFromPath = fn(&Path) -> Option<Uuid>;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Domains without an Instance row that were undefined.
    pub orphan_domains: Vec<Uuid>,
    /// Clones and ISOs without an Instance row that were removed.
    pub orphan_files: Vec<PathBuf>,
    /// Instances whose domain is not defined on the hypervisor.
    pub missing_domains: Vec<Uuid>,
    /// Orphans that could not be removed; they are retried on the next sweep.
    pub failures: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_domains.is_empty()
            && self.orphan_files.is_empty()
            && self.missing_domains.is_empty()
            && self.failures == 0
    }
}

impl<S: InstanceStore> Provisioner<S> {
    /// Converge the host towards the Instance rows.
    ///
    /// Must not run concurrently with [`create_instance`](Self::create_instance):
    /// a creation in flight has its domain and files before its row.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let known: HashSet<Uuid> =
            self.store.list_instances(None).await?.into_iter().map(|i| i.id).collect();
        let defined = self.domains.hypervisor().list_ids(DomainFilter::All).await?;
        let mut report = ReconcileReport::default();

        for id in &defined {
            if known.contains(id) {
                continue;
            }
            match self.domains.delete(id).await {
                Ok(()) => report.orphan_domains.push(*id),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(domain_id = %id, error = %e, "Failed to undefine orphan domain");
                    report.failures += 1;
                }
            }
        }

        let defined: HashSet<Uuid> = defined.into_iter().collect();
        report.missing_domains = known.iter().filter(|id| !defined.contains(id)).copied().collect();
        report.missing_domains.sort();

        let layout = self.layout();
        let candidates: [(&Path, IdFromPath); 2] = [
            (&layout.vm_image_dir, StorageLayout::instance_id_from_vm_image),
            (&layout.cloudinit_dir, StorageLayout::instance_id_from_cloudinit_iso),
        ];
        for (dir, instance_id) in candidates {
            for path in list_files(dir).await? {
                let Some(id) = instance_id(&path) else { continue };
                if known.contains(&id) {
                    continue;
                }
                match remove_if_exists(&path).await {
                    Ok(()) => report.orphan_files.push(path),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove orphan file");
                        report.failures += 1;
                    }
                }
            }
        }
        report.orphan_files.sort();

        info!(
            orphan_domains = report.orphan_domains.len(),
            orphan_files = report.orphan_files.len(),
            missing_domains = report.missing_domains.len(),
            failures = report.failures,
            "Reconciliation complete"
        );
        Ok(report)
    }
}

/// Regular files directly under `dir`; a missing directory has none.
async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProvisionError::io(dir, e)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| ProvisionError::io(dir, e))? {
        let file_type = entry.file_type().await.map_err(|e| ProvisionError::io(entry.path(), e))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}
