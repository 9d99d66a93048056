//! `kvmprov catalog` commands

use crate::client::KvmprovClient;
use anyhow::Result;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct CatalogRow {
    #[tabled(rename = "KIND")]
    kind: &'static str,
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "NAME")]
    name: String,
}

pub async fn add_os(client: &KvmprovClient, name: &str) -> Result<()> {
    let os = client.state.insert_operating_system(name).await?;
    println!("Operating system added: {} (id {})", os.name, os.id);
    Ok(())
}

pub async fn add_arch(client: &KvmprovClient, name: &str) -> Result<()> {
    let arch = client.state.insert_architecture(name).await?;
    println!("Architecture added: {} (id {})", arch.name, arch.id);
    Ok(())
}

pub async fn list(client: &KvmprovClient) -> Result<()> {
    let systems = client.state.list_operating_systems().await?;
    let architectures = client.state.list_architectures().await?;

    let rows: Vec<CatalogRow> = systems
        .into_iter()
        .map(|os| CatalogRow { kind: "os", id: os.id, name: os.name })
        .chain(
            architectures
                .into_iter()
                .map(|arch| CatalogRow { kind: "arch", id: arch.id, name: arch.name }),
        )
        .collect();

    if rows.is_empty() {
        println!("Catalog is empty");
        return Ok(());
    }

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    Ok(())
}
