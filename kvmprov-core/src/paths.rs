//! Centralized path configuration for kvmprov.
//!
//! Every artifact of an instance lives at a location derived from the
//! instance ID alone, so any component can find the clone, the cloud-init
//! ISO and the domain of an instance without consulting another one.

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Get the kvmprov data directory.
///
/// Resolution order:
/// 1. `KVMPROV_DATA_DIR` environment variable
/// 2. `/var/lib/kvmprov` if it exists (system install)
/// 3. `~/.kvmprov` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KVMPROV_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/kvmprov");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".kvmprov")).unwrap_or(system_dir)
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KVMPROV_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    data_dir()
}

/// Get the database path.
pub fn db_path() -> PathBuf {
    data_dir().join("kvmprov.db")
}

/// Get the read-only base image directory.
pub fn base_image_dir() -> PathBuf {
    data_dir().join("base")
}

/// Get the directory holding per-instance disk clones.
pub fn vm_image_dir() -> PathBuf {
    data_dir().join("images")
}

/// Get the directory holding per-instance cloud-init ISOs.
pub fn cloudinit_dir() -> PathBuf {
    data_dir().join("cloudinit")
}

/// Where base images, clones and cloud-init ISOs live on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub base_image_dir: PathBuf,
    /// Extension of base image files, without the dot.
    pub base_image_ext: String,
    pub vm_image_dir: PathBuf,
    pub cloudinit_dir: PathBuf,
}

impl StorageLayout {
    /// Layout rooted at a single directory (used by tests and fresh installs).
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            base_image_dir: root.join("base"),
            base_image_ext: "qcow2".to_string(),
            vm_image_dir: root.join("images"),
            cloudinit_dir: root.join("cloudinit"),
        }
    }

    /// Read-only base image for an OS/architecture pair: `<os>_<arch>.<ext>`.
    pub fn base_image_path(&self, os_name: &str, arch: &str) -> PathBuf {
        self.base_image_dir.join(format!("{}_{}.{}", os_name, arch, self.base_image_ext))
    }

    /// Writable copy-on-write clone of an instance: `<id>.img`.
    pub fn vm_image_path(&self, instance_id: &Uuid) -> PathBuf {
        self.vm_image_dir.join(format!("{}.img", instance_id))
    }

    /// Cloud-init ISO of an instance: `cloudinit_<id>.iso`.
    pub fn cloudinit_iso_path(&self, instance_id: &Uuid) -> PathBuf {
        self.cloudinit_dir.join(format!("cloudinit_{}.iso", instance_id))
    }

    /// Recover the instance ID from a clone file name, if it is one.
    pub fn instance_id_from_vm_image(path: &Path) -> Option<Uuid> {
        let name = path.file_name()?.to_str()?;
        Uuid::parse_str(name.strip_suffix(".img")?).ok()
    }

    /// Recover the instance ID from a cloud-init ISO file name, if it is one.
    pub fn instance_id_from_cloudinit_iso(path: &Path) -> Option<Uuid> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_prefix("cloudinit_")?.strip_suffix(".iso")?;
        Uuid::parse_str(stem).ok()
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            base_image_dir: base_image_dir(),
            base_image_ext: "qcow2".to_string(),
            vm_image_dir: vm_image_dir(),
            cloudinit_dir: cloudinit_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_consistency() {
        let base = data_dir();
        assert!(db_path().starts_with(&base));
        assert!(base_image_dir().starts_with(&base));
        assert!(vm_image_dir().starts_with(&base));
        assert!(cloudinit_dir().starts_with(&base));
    }

    #[test]
    fn test_derived_paths_depend_only_on_id() {
        let layout = StorageLayout::under("/srv/kvm");
        let id = Uuid::parse_str("6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11").unwrap();

        assert_eq!(
            layout.vm_image_path(&id),
            PathBuf::from("/srv/kvm/images/6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11.img")
        );
        assert_eq!(
            layout.cloudinit_iso_path(&id),
            PathBuf::from("/srv/kvm/cloudinit/cloudinit_6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11.iso")
        );
        assert_eq!(layout.vm_image_path(&id), layout.clone().vm_image_path(&id));
    }

    #[test]
    fn test_base_image_keyed_by_os_and_arch() {
        let layout = StorageLayout::under("/srv/kvm");
        assert_eq!(
            layout.base_image_path("ubuntu", "x86_64"),
            PathBuf::from("/srv/kvm/base/ubuntu_x86_64.qcow2")
        );
    }

    #[test]
    fn test_instance_id_round_trips_through_file_names() {
        let layout = StorageLayout::under("/srv/kvm");
        let id = Uuid::new_v4();

        assert_eq!(StorageLayout::instance_id_from_vm_image(&layout.vm_image_path(&id)), Some(id));
        assert_eq!(
            StorageLayout::instance_id_from_cloudinit_iso(&layout.cloudinit_iso_path(&id)),
            Some(id)
        );
        assert_eq!(StorageLayout::instance_id_from_vm_image(Path::new("/tmp/notes.txt")), None);
    }
}
