use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stockflow::config::{StockflowConfig, default_config_path};
use stockflow_common::{Priority, Role};

mod cmd;

#[derive(Parser)]
#[command(name = "stockflow")]
#[command(version, about = "Warehouse inventory transfers: server, client and workflow")]
pub struct Cli {
    /// Path to stockflow.toml (defaults to .stockflow/stockflow.toml)
    #[arg(long, global = true, env = "STOCKFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Act as this user id (overrides [client] user_id)
    #[arg(long, global = true)]
    pub as_user: Option<i64>,

    /// Role to act with: user, qc, manager, admin
    #[arg(long, global = true)]
    pub role: Option<Role>,

    /// Server base URL (overrides [client] base_url)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the transfer server
    Serve {
        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides [server] db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Initialize the database only (don't start the server)
        #[arg(long)]
        init: bool,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show the identity the server sees for this client
    Whoami,
    /// List, inspect and move transfers through the workflow
    Transfers {
        #[command(subcommand)]
        command: TransferCommands,
    },
    /// Add or remove transfer lines
    Items {
        #[command(subcommand)]
        command: ItemCommands,
    },
    /// Manage serial numbers on a transfer line
    Serials {
        #[command(subcommand)]
        command: SerialCommands,
    },
    /// Look up items and serials in the ERP
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (password redacted)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a starter stockflow.toml with a sample offline catalog
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum TransferCommands {
    /// List transfers with their allowed actions
    List {
        #[arg(long, default_value = "1")]
        page: u32,
        /// One of 10, 25, 50, 100 (defaults to [client] page_size)
        #[arg(long)]
        page_size: Option<u32>,
        /// Free-text search over number, locations, notes, status and item codes
        #[arg(short, long)]
        search: Option<String>,
        /// Include transfers owned by other users
        #[arg(long)]
        all: bool,
    },
    /// Show one transfer with items, serials and history
    Show { id: i64 },
    /// Create a draft transfer
    Create {
        /// Source location
        #[arg(long = "from")]
        source: String,
        /// Destination location
        #[arg(long = "to")]
        destination: String,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        priority: Option<Priority>,
        /// Use this transfer number instead of a generated one
        #[arg(long)]
        number: Option<String>,
    },
    /// Delete a draft transfer
    Delete { id: i64 },
    /// Submit a draft for QC review
    Submit { id: i64 },
    /// Approve a submitted transfer
    Approve { id: i64 },
    /// Reject a submitted transfer
    Reject {
        id: i64,
        #[arg(short, long)]
        reason: String,
    },
    /// Post an approved transfer to the ERP
    Post { id: i64 },
    /// Reopen a rejected transfer as a draft
    Reopen { id: i64 },
    /// Show the status history of a transfer
    History { id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum ItemCommands {
    /// Add an item line to a draft transfer
    Add {
        transfer_id: i64,
        item_code: String,
        quantity: f64,
        #[arg(long)]
        batch: Option<String>,
    },
    /// Remove an item line
    Remove { item_id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum SerialCommands {
    /// List serials attached to an item line
    List { item_id: i64 },
    /// Attach serials; more than one is sent as a bulk request
    Add {
        item_id: i64,
        #[arg(required = true)]
        serials: Vec<String>,
    },
    /// Replace a serial number
    Edit { serial_id: i64, serial: String },
    /// Detach a serial number
    Remove { serial_id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum CatalogCommands {
    /// Resolve an item code to its description
    Item { code: String },
    /// Check a serial against the ERP at a location
    Serial {
        item_code: String,
        serial: String,
        #[arg(long)]
        location: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is normal
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = StockflowConfig::load_or_default(&config_path)?;
    config.apply_env_overrides()?;
    if let Some(url) = &cli.server {
        config.client.base_url = url.clone();
    }
    if let Some(user_id) = cli.as_user {
        config.client.user_id = Some(user_id);
    }
    if let Some(role) = cli.role {
        config.client.role = Some(role);
    }

    let _log_guard = stockflow::telemetry::init_tracing(&config.logging)?;

    match &cli.command {
        Commands::Serve {
            port,
            db_path,
            init,
            dev,
        } => {
            cmd::cmd_serve(config, *port, db_path.clone(), *init, *dev).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&config_path, &config, command.clone(), cli.json)?
        }
        Commands::Whoami => cmd::cmd_whoami(&config, cli.json).await?,
        Commands::Transfers { command } => {
            cmd::cmd_transfers(&config, command.clone(), cli.json).await?
        }
        Commands::Items { command } => cmd::cmd_items(&config, command.clone(), cli.json).await?,
        Commands::Serials { command } => {
            cmd::cmd_serials(&config, command.clone(), cli.json).await?
        }
        Commands::Catalog { command } => {
            cmd::cmd_catalog(&config, command.clone(), cli.json).await?
        }
    }

    Ok(())
}
