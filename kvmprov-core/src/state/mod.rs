//! State management with SQLite persistence.
//!
//! The StateManager holds the durable records of kvmprov:
//! - Instances and their private networks
//! - The operating system and architecture catalogs
//!
//! Provisioning goes through the [`InstanceStore`] interface, which exposes
//! explicit transactions so the orchestrator can order commits against
//! hypervisor and filesystem side effects.

use crate::error::{ProvisionError, Result};
use crate::observability::metrics;
use crate::types::{Architecture, Instance, Network, OperatingSystem};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tracing::{info, instrument};
use uuid::Uuid;

pub mod migrations;
pub mod store;

pub use store::InstanceStore;


/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");
        if !in_memory {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ProvisionError::InvalidConfig {
                        reason: format!("Failed to create directory {}: {}", parent.display(), e),
                    }
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            ProvisionError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| ProvisionError::Database(e.to_string()))?;

        options = options.create_if_missing(true).foreign_keys(true);

        // An in-memory database lives as long as its one connection does.
        let pool_options = if in_memory {
            SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| ProvisionError::Database(e.to_string()))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    // ========================
    // Catalog Operations
    // ========================

    #[instrument(skip(self))]
    pub async fn insert_operating_system(&self, name: &str) -> Result<OperatingSystem> {
        let result = sqlx::query("INSERT INTO operating_systems (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error("insert_operating_system"))?;
        Ok(OperatingSystem { id: result.last_insert_rowid(), name: name.to_string() })
    }

    #[instrument(skip(self))]
    pub async fn insert_architecture(&self, name: &str) -> Result<Architecture> {
        let result = sqlx::query("INSERT INTO architectures (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error("insert_architecture"))?;
        Ok(Architecture { id: result.last_insert_rowid(), name: name.to_string() })
    }

    pub async fn list_operating_systems(&self) -> Result<Vec<OperatingSystem>> {
        let rows = sqlx::query("SELECT id, name FROM operating_systems ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_operating_systems"))?;
        Ok(rows
            .iter()
            .map(|r| OperatingSystem { id: r.get("id"), name: r.get("name") })
            .collect())
    }

    pub async fn list_architectures(&self) -> Result<Vec<Architecture>> {
        let rows = sqlx::query("SELECT id, name FROM architectures ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_architectures"))?;
        Ok(rows.iter().map(|r| Architecture { id: r.get("id"), name: r.get("name") }).collect())
    }

    // ========================
    // Network Operations
    // ========================

    #[instrument(skip(self), fields(network_id = %id))]
    pub async fn get_network(&self, id: &Uuid) -> Result<Network> {
        let row = sqlx::query("SELECT * FROM networks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_network"))?
            .ok_or_else(|| ProvisionError::not_found("Network", id))?;
        row_to_network(&row)
    }
}

/// Map a sqlx failure to a database error, counting it under `operation`.
pub(crate) fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> ProvisionError {
    move |e| {
        metrics::record_db_error(operation);
        ProvisionError::Database(format!("{}: {}", operation, e))
    }
}

pub(crate) fn to_unix_secs(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

pub(crate) fn from_unix_secs(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let text: String = row.get(column);
    Uuid::parse_str(&text)
        .map_err(|e| ProvisionError::Database(format!("corrupt {} '{}': {}", column, text, e)))
}

pub(crate) fn row_to_instance(row: &SqliteRow) -> Result<Instance> {
    Ok(Instance {
        id: parse_uuid(row, "id")?,
        owner_id: row.get("owner_id"),
        network_id: parse_uuid(row, "network_id")?,
        os_id: row.get("os_id"),
        arch_id: row.get("arch_id"),
        name: row.get("name"),
        cpu_cores: row.get::<i64, _>("cpu_cores") as u32,
        ram_mib: row.get::<i64, _>("ram_mib") as u32,
        storage_gib: row.get::<i64, _>("storage_gib") as u32,
        created_at: from_unix_secs(row.get("created_at")),
        updated_at: from_unix_secs(row.get("updated_at")),
    })
}

pub(crate) fn row_to_network(row: &SqliteRow) -> Result<Network> {
    Ok(Network {
        id: parse_uuid(row, "id")?,
        private_ip: row.get("private_ip"),
        created_at: from_unix_secs(row.get("created_at")),
    })
}
