//! `kvmprov reconcile` command

use crate::client::KvmprovClient;
use anyhow::Result;

pub async fn reconcile(client: &KvmprovClient, json: bool) -> Result<()> {
    let report = client.provisioner.reconcile().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if report.is_clean() {
        println!("Host is consistent with the database");
        return Ok(());
    }

    for id in &report.orphan_domains {
        println!("Undefined orphan domain {}", id);
    }
    for path in &report.orphan_files {
        println!("Removed orphan file {}", path.display());
    }
    for id in &report.missing_domains {
        println!("Instance {} has no domain", id);
    }
    if report.failures > 0 {
        println!("{} orphan(s) could not be removed, see log", report.failures);
    }
    Ok(())
}
