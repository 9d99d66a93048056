//! `kvmprov create|get|list|update|delete|start|stop`

use crate::client::KvmprovClient;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kvmprov_core::{CreateInstanceRequest, Instance, OwnerId, UpdateInstanceRequest};
use tabled::{settings::Style, Table, Tabled};
use uuid::Uuid;

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "OWNER")]
    owner: OwnerId,
    #[tabled(rename = "CPUS")]
    cpus: u32,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "DISK")]
    disk: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<&Instance> for InstanceRow {
    fn from(instance: &Instance) -> Self {
        Self {
            id: instance.id.to_string(),
            name: instance.name.clone(),
            owner: instance.owner_id,
            cpus: instance.cpu_cores,
            memory: format!("{}M", instance.ram_mib),
            disk: format!("{}G", instance.storage_gib),
            created: DateTime::<Utc>::from(instance.created_at)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        }
    }
}

fn print_table<'a>(instances: impl IntoIterator<Item = &'a Instance>) {
    let rows: Vec<InstanceRow> = instances.into_iter().map(InstanceRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid instance ID: {}", id))
}

pub async fn create(client: &KvmprovClient, request: CreateInstanceRequest) -> Result<()> {
    let instance = client.provisioner.create_instance(&request).await?;
    println!("Instance created: {}", instance.id);
    print_table([&instance]);
    Ok(())
}

pub async fn get(client: &KvmprovClient, id: &str, owner: Option<OwnerId>) -> Result<()> {
    let id = parse_id(id)?;
    let instance = client.provisioner.get_instance(&id, owner).await?;
    print_table([&instance]);

    match client.provisioner.instance_state(&id, owner).await {
        Ok(state) => println!("State: {}", state),
        Err(e) if e.is_not_found() => println!("State: domain missing"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

pub async fn list(client: &KvmprovClient, owner: Option<OwnerId>, json: bool) -> Result<()> {
    let instances = client.provisioner.list_instances(owner).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }
    if instances.is_empty() {
        println!("No instances");
        return Ok(());
    }
    print_table(&instances);
    Ok(())
}

pub async fn update(
    client: &KvmprovClient,
    id: &str,
    owner: Option<OwnerId>,
    request: UpdateInstanceRequest,
) -> Result<()> {
    let id = parse_id(id)?;
    let instance = client.provisioner.update_instance(&id, owner, &request).await?;
    println!("Instance updated: {} (domain left stopped)", instance.id);
    print_table([&instance]);
    Ok(())
}

pub async fn delete(client: &KvmprovClient, id: &str, owner: Option<OwnerId>) -> Result<()> {
    let id = parse_id(id)?;
    client.provisioner.delete_instance(&id, owner).await?;
    println!("Instance deleted: {}", id);
    Ok(())
}

pub async fn start(client: &KvmprovClient, id: &str, owner: Option<OwnerId>) -> Result<()> {
    let id = parse_id(id)?;
    client.provisioner.start_instance(&id, owner).await?;
    println!("Instance started: {}", id);
    Ok(())
}

pub async fn stop(client: &KvmprovClient, id: &str, owner: Option<OwnerId>) -> Result<()> {
    let id = parse_id(id)?;
    client.provisioner.stop_instance(&id, owner).await?;
    println!("Shutdown requested: {}", id);
    Ok(())
}
