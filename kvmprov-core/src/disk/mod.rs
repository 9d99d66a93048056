//! Copy-on-write disk clones of base OS images.
//!
//! Uses the external image utility (`qemu-img` by default) to create a
//! backing-file clone that shares unmodified blocks with the base image.

use crate::error::{ProvisionError, Result};
use crate::observability::metrics;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Creates and removes per-instance disk clones.
#[derive(Debug, Clone)]
pub struct DiskCloner {
    tool: PathBuf,
    format: String,
}

impl DiskCloner {
    /// `tool` is the image utility binary; `format` the container format of
    /// both the base image and the clone (e.g. `qcow2`).
    pub fn new(tool: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self { tool: tool.into(), format: format.into() }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Clone `base` into `clone`, sized to `size_gib` GiB.
    ///
    /// Runs `<tool> create -b <base> -f <fmt> -F <fmt> <clone> <size>G`.
    #[instrument(skip(self), fields(base = %base.display(), clone = %clone.display()))]
    pub async fn clone_image(&self, base: &Path, clone: &Path, size_gib: u32) -> Result<()> {
        if size_gib == 0 {
            return Err(ProvisionError::invalid_input("clone size must be at least 1 GiB"));
        }
        if !tokio::fs::try_exists(base).await.map_err(|e| ProvisionError::io(base, e))? {
            return Err(ProvisionError::invalid_input(format!(
                "base image {} does not exist",
                base.display()
            )));
        }
        if let Some(dir) = clone.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| ProvisionError::io(dir, e))?;
        }

        info!("Cloning base image ({} GiB)", size_gib);
        let started = Instant::now();

        let output = Command::new(&self.tool)
            .arg("create")
            .arg("-b")
            .arg(base)
            .arg("-f")
            .arg(&self.format)
            .arg("-F")
            .arg(&self.format)
            .arg(clone)
            .arg(format!("{}G", size_gib))
            .output()
            .await
            .map_err(|e| ProvisionError::ExternalTool {
                tool: self.tool.display().to_string(),
                status: -1,
                stderr: format!("failed to spawn: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = ?output.status.code(), stderr = %stderr, "Disk clone failed");
            return Err(ProvisionError::ExternalTool {
                tool: self.tool.display().to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        metrics::record_clone_duration(started.elapsed().as_secs_f64());
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Disk clone created");
        Ok(())
    }

    /// Delete a clone. A missing file is not an error.
    #[instrument(skip(self), fields(clone = %clone.display()))]
    pub async fn remove_clone(&self, clone: &Path) -> Result<()> {
        remove_if_exists(clone).await
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProvisionError::io(path, e)),
    }
}
