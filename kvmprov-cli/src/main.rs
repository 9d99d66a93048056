use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use kvmprov_core::{CreateInstanceRequest, OwnerId, UpdateInstanceRequest};
use std::path::PathBuf;

mod client;
mod commands;

#[derive(Parser)]
#[command(name = "kvmprov")]
#[command(about = "KVM instance provisioning CLI", long_about = None)]
struct Cli {
    /// Configuration file (defaults to <config dir>/config.json)
    #[arg(long, global = true, env = "KVMPROV_CONFIG")]
    config: Option<PathBuf>,

    /// Act on behalf of this account; omit for administrative access.
    /// Required by `create`.
    #[arg(long, global = true)]
    owner: Option<OwnerId>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new instance
    Create {
        /// Instance name (also the guest hostname)
        name: String,

        /// Operating system catalog name
        #[arg(long, default_value = "ubuntu")]
        os: String,

        /// Architecture catalog name
        #[arg(long, default_value = "x86_64")]
        arch: String,

        /// Number of CPU cores
        #[arg(short, long, default_value = "2")]
        cpus: u32,

        /// Memory in MiB
        #[arg(short, long, default_value = "2048")]
        memory: u32,

        /// Disk size in GiB
        #[arg(short, long, default_value = "20")]
        disk: u32,

        /// Guest login created by cloud-init
        #[arg(long, default_value = "ops")]
        login: String,

        /// Authorized SSH public key (repeatable)
        #[arg(long = "ssh-key")]
        ssh_keys: Vec<String>,

        /// Crypt-style password hash for the login
        #[arg(long)]
        password_hash: Option<String>,

        /// Static private address in CIDR notation (DHCP when omitted)
        #[arg(long)]
        ip: Option<String>,

        /// Default gateway for a static address
        #[arg(long)]
        gateway: Option<String>,

        /// DNS server for a static address (repeatable)
        #[arg(long = "dns")]
        nameservers: Vec<String>,
    },

    /// Show one instance
    Get {
        /// Instance ID
        id: String,
    },

    /// List instances
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Change name, CPU or memory (a running instance is stopped)
    Update {
        /// Instance ID
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// Number of CPU cores
        #[arg(short, long)]
        cpus: Option<u32>,

        /// Memory in MiB
        #[arg(short, long)]
        memory: Option<u32>,
    },

    /// Decommission an instance and remove its files
    Delete {
        /// Instance ID
        id: String,
    },

    /// Boot an instance
    Start {
        /// Instance ID
        id: String,
    },

    /// Request a graceful shutdown
    Stop {
        /// Instance ID
        id: String,
    },

    /// Remove orphaned domains and files, report instances without a domain
    Reconcile {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Manage the operating system and architecture catalog
    #[command(subcommand)]
    Catalog(CatalogCommands),
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Register an operating system
    AddOs {
        /// Name matching the base image prefix, e.g. "ubuntu"
        name: String,
    },

    /// Register an architecture
    AddArch {
        /// Name matching the base image suffix, e.g. "x86_64"
        name: String,
    },

    /// List catalog entries
    List,
}

/// Instances always belong to an account; there is no implicit one.
fn require_owner(owner: Option<OwnerId>) -> Result<OwnerId> {
    match owner {
        Some(owner) => Ok(owner),
        None => bail!("--owner is required to create an instance"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = client::KvmprovClient::connect(cli.config.as_deref()).await?;
    let owner = cli.owner;

    match cli.command {
        Commands::Create {
            name,
            os,
            arch,
            cpus,
            memory,
            disk,
            login,
            ssh_keys,
            password_hash,
            ip,
            gateway,
            nameservers,
        } => {
            let request = CreateInstanceRequest {
                owner_id: require_owner(owner)?,
                name,
                os,
                arch,
                cpu_cores: cpus,
                ram_mib: memory,
                storage_gib: disk,
                login,
                ssh_keys,
                password_hash,
                private_ip: ip,
                gateway,
                nameservers,
            };
            commands::instances::create(&client, request).await?;
        }

        Commands::Get { id } => {
            commands::instances::get(&client, &id, owner).await?;
        }

        Commands::List { json } => {
            commands::instances::list(&client, owner, json).await?;
        }

        Commands::Update { id, name, cpus, memory } => {
            let request = UpdateInstanceRequest { name, cpu_cores: cpus, ram_mib: memory };
            commands::instances::update(&client, &id, owner, request).await?;
        }

        Commands::Delete { id } => {
            commands::instances::delete(&client, &id, owner).await?;
        }

        Commands::Start { id } => {
            commands::instances::start(&client, &id, owner).await?;
        }

        Commands::Stop { id } => {
            commands::instances::stop(&client, &id, owner).await?;
        }

        Commands::Reconcile { json } => {
            commands::reconcile(&client, json).await?;
        }

        Commands::Catalog(catalog_cmd) => match catalog_cmd {
            CatalogCommands::AddOs { name } => {
                commands::catalog::add_os(&client, &name).await?;
            }

            CatalogCommands::AddArch { name } => {
                commands::catalog::add_arch(&client, &name).await?;
            }

            CatalogCommands::List => {
                commands::catalog::list(&client).await?;
            }
        },
    }

    Ok(())
}
