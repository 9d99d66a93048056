//! Configuration management.

use crate::error::{ProvisionError, Result};
use crate::paths::{self, StorageLayout};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent configuration for kvmprov.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// libvirt connection URI of the local hypervisor.
    pub hypervisor_uri: String,
    pub virsh_path: String,
    pub qemu_img_path: String,
    /// Container format of clones and their backing files.
    pub image_format: String,
    pub base_image_dir: String,
    pub base_image_ext: String,
    pub vm_image_dir: String,
    pub cloudinit_dir: String,
    pub db_path: String,
    /// libvirt network every instance NIC is attached to.
    pub network: String,
    pub log_level: String,
    /// Address for the Prometheus exporter, e.g. `127.0.0.1:9464`. Disabled when unset.
    pub metrics_listen: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hypervisor_uri: "qemu:///system".to_string(),
            virsh_path: "virsh".to_string(),
            qemu_img_path: "qemu-img".to_string(),
            image_format: "qcow2".to_string(),
            base_image_dir: paths::base_image_dir().to_string_lossy().to_string(),
            base_image_ext: "qcow2".to_string(),
            vm_image_dir: paths::vm_image_dir().to_string_lossy().to_string(),
            cloudinit_dir: paths::cloudinit_dir().to_string_lossy().to_string(),
            db_path: paths::db_path().to_string_lossy().to_string(),
            network: "default".to_string(),
            log_level: "info".to_string(),
            metrics_listen: None,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from `path` (defaults when it does not exist), then apply
    /// environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ProvisionError::InvalidConfig { reason: format!("Failed to read config: {}", e) }
            })?;
            serde_json::from_str(&content).map_err(|e| ProvisionError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProvisionError::io(parent.to_path_buf(), e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            ProvisionError::InvalidConfig { reason: format!("Failed to serialize config: {}", e) }
        })?;
        std::fs::write(&path, content).map_err(|e| ProvisionError::io(path, e))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides: [(&str, &mut String); 6] = [
            ("KVMPROV_HYPERVISOR_URI", &mut self.hypervisor_uri),
            ("KVMPROV_DB_PATH", &mut self.db_path),
            ("KVMPROV_QEMU_IMG", &mut self.qemu_img_path),
            ("KVMPROV_VIRSH", &mut self.virsh_path),
            ("KVMPROV_LOG_LEVEL", &mut self.log_level),
            ("KVMPROV_NETWORK", &mut self.network),
        ];
        for (key, field) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *field = value;
            }
        }
        if let Some(listen) = lookup("KVMPROV_METRICS_LISTEN").filter(|v| !v.trim().is_empty()) {
            self.metrics_listen = Some(listen);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.hypervisor_uri.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig {
                reason: "hypervisor_uri must not be empty".to_string(),
            });
        }
        if self.image_format.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig {
                reason: "image_format must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Artifact locations derived from this configuration.
    pub fn layout(&self) -> StorageLayout {
        StorageLayout {
            base_image_dir: PathBuf::from(&self.base_image_dir),
            base_image_ext: self.base_image_ext.clone(),
            vm_image_dir: PathBuf::from(&self.vm_image_dir),
            cloudinit_dir: PathBuf::from(&self.cloudinit_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.image_format, "qcow2");
        assert_eq!(config.network, "default");
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"vm_image_dir": "/data/vms", "base_image_ext": "img"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        let layout = config.layout();
        assert_eq!(layout.vm_image_dir, PathBuf::from("/data/vms"));
        assert_eq!(layout.base_image_ext, "img");
        assert_eq!(config.qemu_img_path, "qemu-img");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KVMPROV_HYPERVISOR_URI", "qemu+ssh://host/system"),
            ("KVMPROV_METRICS_LISTEN", "127.0.0.1:9464"),
            ("KVMPROV_VIRSH", ""),
        ]);
        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.hypervisor_uri, "qemu+ssh://host/system");
        assert_eq!(config.metrics_listen.as_deref(), Some("127.0.0.1:9464"));
        assert_eq!(config.virsh_path, "virsh");
    }

    #[test]
    fn test_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ProvisionError::InvalidConfig { .. })));
    }
}
