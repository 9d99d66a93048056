//! Persistence interface consumed by the provisioner.

use super::{db_error, from_unix_secs, row_to_instance, to_unix_secs, StateManager};
use crate::error::{ProvisionError, Result};
use crate::types::{
    Architecture, Instance, InstanceChanges, Network, NewInstance, NewNetwork, OperatingSystem,
    OwnerId,
};
use async_trait::async_trait;
use sqlx::{Row, Sqlite, Transaction};
use std::time::SystemTime;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Transactional instance storage.
///
/// Writes take an explicit transaction; nothing is visible to readers until
/// [`commit`](InstanceStore::commit). An `owner` of `None` matches any owner.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    async fn create_network(&self, tx: &mut Self::Tx, fields: &NewNetwork) -> Result<Network>;

    async fn create_instance(&self, tx: &mut Self::Tx, fields: &NewInstance) -> Result<Instance>;

    /// Apply `changes` to an instance row and return the updated row.
    async fn update_instance(
        &self,
        tx: &mut Self::Tx,
        id: &Uuid,
        owner: Option<OwnerId>,
        changes: &InstanceChanges,
    ) -> Result<Instance>;

    /// Delete an instance row and return it. NotFound if absent or owned by someone else.
    async fn delete_instance(
        &self,
        tx: &mut Self::Tx,
        id: &Uuid,
        owner: Option<OwnerId>,
    ) -> Result<Instance>;

    async fn delete_network(&self, tx: &mut Self::Tx, id: &Uuid) -> Result<()>;

    async fn get_instance(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<Instance>;

    async fn list_instances(&self, owner: Option<OwnerId>) -> Result<Vec<Instance>>;

    async fn find_operating_system(&self, name: &str) -> Result<OperatingSystem>;

    async fn find_architecture(&self, name: &str) -> Result<Architecture>;
}

/// Current time at the one-second resolution rows are stored with.
fn now() -> SystemTime {
    from_unix_secs(to_unix_secs(SystemTime::now()))
}

const SELECT_OWNED_INSTANCE: &str =
    "SELECT * FROM instances WHERE id = ? AND (? IS NULL OR owner_id = ?)";

#[async_trait]
impl InstanceStore for StateManager {
    type Tx = Transaction<'static, Sqlite>;

    async fn begin(&self) -> Result<Self::Tx> {
        self.pool().begin().await.map_err(db_error("begin"))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await.map_err(db_error("commit"))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await.map_err(db_error("rollback"))
    }

    #[instrument(skip(self, tx, fields), fields(network_id = %fields.id))]
    async fn create_network(&self, tx: &mut Self::Tx, fields: &NewNetwork) -> Result<Network> {
        let created_at = now();
        sqlx::query("INSERT INTO networks (id, private_ip, created_at) VALUES (?, ?, ?)")
            .bind(fields.id.to_string())
            .bind(&fields.private_ip)
            .bind(to_unix_secs(created_at))
            .execute(&mut **tx)
            .await
            .map_err(db_error("create_network"))?;

        debug!("Network row inserted");
        Ok(Network { id: fields.id, private_ip: fields.private_ip.clone(), created_at })
    }

    #[instrument(skip(self, tx, fields), fields(instance_id = %fields.id))]
    async fn create_instance(&self, tx: &mut Self::Tx, fields: &NewInstance) -> Result<Instance> {
        let timestamp = now();
        sqlx::query(
            r#"
            INSERT INTO instances (id, owner_id, network_id, os_id, arch_id, name,
                                   cpu_cores, ram_mib, storage_gib, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fields.id.to_string())
        .bind(fields.owner_id)
        .bind(fields.network_id.to_string())
        .bind(fields.os_id)
        .bind(fields.arch_id)
        .bind(&fields.name)
        .bind(i64::from(fields.cpu_cores))
        .bind(i64::from(fields.ram_mib))
        .bind(i64::from(fields.storage_gib))
        .bind(to_unix_secs(timestamp))
        .bind(to_unix_secs(timestamp))
        .execute(&mut **tx)
        .await
        .map_err(db_error("create_instance"))?;

        debug!("Instance row inserted");
        Ok(Instance {
            id: fields.id,
            owner_id: fields.owner_id,
            network_id: fields.network_id,
            os_id: fields.os_id,
            arch_id: fields.arch_id,
            name: fields.name.clone(),
            cpu_cores: fields.cpu_cores,
            ram_mib: fields.ram_mib,
            storage_gib: fields.storage_gib,
            created_at: timestamp,
            updated_at: timestamp,
        })
    }

    #[instrument(skip(self, tx, changes), fields(instance_id = %id))]
    async fn update_instance(
        &self,
        tx: &mut Self::Tx,
        id: &Uuid,
        owner: Option<OwnerId>,
        changes: &InstanceChanges,
    ) -> Result<Instance> {
        let row = sqlx::query(SELECT_OWNED_INSTANCE)
            .bind(id.to_string())
            .bind(owner)
            .bind(owner)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error("update_instance"))?
            .ok_or_else(|| ProvisionError::not_found("Instance", id))?;
        let mut instance = row_to_instance(&row)?;

        if let Some(name) = &changes.name {
            instance.name = name.clone();
        }
        if let Some(cores) = changes.cpu_cores {
            instance.cpu_cores = cores;
        }
        if let Some(ram) = changes.ram_mib {
            instance.ram_mib = ram;
        }
        instance.updated_at = now();

        sqlx::query(
            "UPDATE instances SET name = ?, cpu_cores = ?, ram_mib = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&instance.name)
        .bind(i64::from(instance.cpu_cores))
        .bind(i64::from(instance.ram_mib))
        .bind(to_unix_secs(instance.updated_at))
        .bind(id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(db_error("update_instance"))?;

        Ok(instance)
    }

    #[instrument(skip(self, tx), fields(instance_id = %id))]
    async fn delete_instance(
        &self,
        tx: &mut Self::Tx,
        id: &Uuid,
        owner: Option<OwnerId>,
    ) -> Result<Instance> {
        let row = sqlx::query(SELECT_OWNED_INSTANCE)
            .bind(id.to_string())
            .bind(owner)
            .bind(owner)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error("delete_instance"))?
            .ok_or_else(|| ProvisionError::not_found("Instance", id))?;
        let instance = row_to_instance(&row)?;

        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_error("delete_instance"))?;

        debug!("Instance row deleted");
        Ok(instance)
    }

    #[instrument(skip(self, tx), fields(network_id = %id))]
    async fn delete_network(&self, tx: &mut Self::Tx, id: &Uuid) -> Result<()> {
        sqlx::query("DELETE FROM networks WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_error("delete_network"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    async fn get_instance(&self, id: &Uuid, owner: Option<OwnerId>) -> Result<Instance> {
        let row = sqlx::query(SELECT_OWNED_INSTANCE)
            .bind(id.to_string())
            .bind(owner)
            .bind(owner)
            .fetch_optional(self.pool())
            .await
            .map_err(db_error("get_instance"))?
            .ok_or_else(|| ProvisionError::not_found("Instance", id))?;
        row_to_instance(&row)
    }

    #[instrument(skip(self))]
    async fn list_instances(&self, owner: Option<OwnerId>) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM instances WHERE (? IS NULL OR owner_id = ?) ORDER BY created_at DESC",
        )
        .bind(owner)
        .bind(owner)
        .fetch_all(self.pool())
        .await
        .map_err(db_error("list_instances"))?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn find_operating_system(&self, name: &str) -> Result<OperatingSystem> {
        let row = sqlx::query("SELECT id, name FROM operating_systems WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(db_error("find_operating_system"))?
            .ok_or_else(|| ProvisionError::not_found("Operating system", name))?;
        Ok(OperatingSystem { id: row.get("id"), name: row.get("name") })
    }

    async fn find_architecture(&self, name: &str) -> Result<Architecture> {
        let row = sqlx::query("SELECT id, name FROM architectures WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(db_error("find_architecture"))?
            .ok_or_else(|| ProvisionError::not_found("Architecture", name))?;
        Ok(Architecture { id: row.get("id"), name: row.get("name") })
    }
}
