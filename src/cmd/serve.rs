//! Transfer server command: `stockflow serve`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use stockflow::config::StockflowConfig;
use stockflow::warehouse::db::TransferDb;
use stockflow::warehouse::erp::build_erp;
use stockflow::warehouse::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    mut config: StockflowConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    init: bool,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(path) = db_path {
        config.server.db_path = path;
    }
    if dev {
        config.server.dev_mode = true;
    }

    if init {
        TransferDb::new(&config.server.db_path).with_context(|| {
            format!(
                "Failed to initialize database at {}",
                config.server.db_path.display()
            )
        })?;
        println!(
            "Transfer database initialized at {}",
            config.server.db_path.display()
        );
        return Ok(());
    }

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    match &config.erp.base_url {
        Some(url) => tracing::info!(erp = %url, "Using SAP Business One Service Layer"),
        None => tracing::info!(
            items = config.catalog.items.len(),
            serials = config.catalog.serials.len(),
            "No ERP configured; serving the offline catalog"
        ),
    }

    let erp = build_erp(&config)?;
    start_server(ServerConfig::from(&config), erp).await
}
