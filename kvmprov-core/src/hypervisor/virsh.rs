//! libvirt client driving `virsh -c <uri>`.
//!
//! The connection is probed once, on first use, and cached for the life of
//! the handle. Concurrent first callers wait on the same probe.

use crate::config::Config;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;
use crate::observability::metrics;
use crate::types::{DomainFilter, DomainState};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// libvirt hypervisor reached through the `virsh` client.
pub struct VirshHypervisor {
    binary: PathBuf,
    uri: String,
    connected: OnceCell<()>,
}

impl VirshHypervisor {
    pub fn new(binary: impl Into<PathBuf>, uri: impl Into<String>) -> Self {
        Self { binary: binary.into(), uri: uri.into(), connected: OnceCell::new() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.virsh_path, &config.hypervisor_uri)
    }

    /// Probe the daemon once. Failures are returned as-is and not retried here.
    async fn ensure_connected(&self) -> Result<()> {
        self.connected
            .get_or_try_init(|| async {
                let output = Command::new(&self.binary)
                    .args(["-c", &self.uri, "uri"])
                    .output()
                    .await
                    .map_err(|e| ProvisionError::HypervisorConnection {
                        uri: self.uri.clone(),
                        reason: format!("failed to run {}: {}", self.binary.display(), e),
                    })?;
                if !output.status.success() {
                    metrics::record_hypervisor_error("connect");
                    return Err(ProvisionError::HypervisorConnection {
                        uri: self.uri.clone(),
                        reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
                info!(uri = %self.uri, "Connected to hypervisor");
                Ok::<(), ProvisionError>(())
            })
            .await
            .map(|_| ())
    }

    /// Run one virsh command against the connection and return its stdout.
    async fn virsh(
        &self,
        operation: &'static str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String> {
        self.ensure_connected().await?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c").arg(&self.uri).args(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn().map_err(|e| ProvisionError::HypervisorConnection {
            uri: self.uri.clone(),
            reason: format!("failed to run {}: {}", self.binary.display(), e),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(|e| {
                ProvisionError::Internal(format!("failed to write to virsh: {}", e))
            })?;
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(|e| {
            ProvisionError::Internal(format!("failed to wait for virsh: {}", e))
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        metrics::record_hypervisor_error(operation);
        if is_missing_domain(&stderr) {
            let id = args.last().copied().unwrap_or_default();
            return Err(ProvisionError::not_found("Domain", id));
        }
        warn!(operation, stderr = %stderr, "virsh command failed");
        Err(ProvisionError::HypervisorRejected { operation: operation.to_string(), reason: stderr })
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("Domain not found") || stderr.contains("failed to get domain")
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self, xml))]
    async fn define_xml(&self, xml: &str) -> Result<()> {
        self.virsh("define", &["define", "/dev/stdin"], Some(xml)).await?;
        debug!("Domain defined");
        Ok(())
    }

    #[instrument(skip(self), fields(domain_id = %id))]
    async fn undefine(&self, id: &Uuid) -> Result<()> {
        self.virsh("undefine", &["undefine", &id.to_string()], None).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain_id = %id))]
    async fn dump_xml(&self, id: &Uuid) -> Result<Option<String>> {
        match self.virsh("dumpxml", &["dumpxml", &id.to_string()], None).await {
            Ok(xml) => Ok(Some(xml)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn list_ids(&self, filter: DomainFilter) -> Result<Vec<Uuid>> {
        let mut args = vec!["list", "--name"];
        match filter {
            DomainFilter::All => args.push("--all"),
            DomainFilter::Inactive => args.push("--inactive"),
            DomainFilter::Active => {}
        }
        let out = self.virsh("list", &args, None).await?;
        Ok(parse_domain_names(&out))
    }

    #[instrument(skip(self), fields(domain_id = %id))]
    async fn state(&self, id: &Uuid) -> Result<DomainState> {
        let out = self.virsh("domstate", &["domstate", &id.to_string()], None).await?;
        Ok(DomainState::parse(&out))
    }

    #[instrument(skip(self), fields(domain_id = %id))]
    async fn start(&self, id: &Uuid) -> Result<()> {
        self.virsh("start", &["start", &id.to_string()], None).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain_id = %id))]
    async fn shutdown(&self, id: &Uuid) -> Result<()> {
        self.virsh("shutdown", &["shutdown", &id.to_string()], None).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain_id = %id))]
    async fn destroy(&self, id: &Uuid) -> Result<()> {
        self.virsh("destroy", &["destroy", &id.to_string()], None).await?;
        Ok(())
    }
}

/// Domains not named by a UUID belong to someone else and are skipped.
fn parse_domain_names(out: &str) -> Vec<Uuid> {
    out.lines().filter_map(|l| Uuid::parse_str(l.trim()).ok()).collect()
}
