//! Configuration view and validation commands: `stockflow config`.

use std::path::Path;

use anyhow::{Context, Result};
use stockflow::config::StockflowConfig;

use super::super::ConfigCommands;
use super::print_json;

pub fn cmd_config(
    config_path: &Path,
    effective: &StockflowConfig,
    command: Option<ConfigCommands>,
    json: bool,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let redacted = effective.redacted();
            if json {
                return print_json(&redacted);
            }
            println!();
            println!("Stockflow Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!(
                    "No config file at {} (using defaults)",
                    config_path.display()
                );
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&redacted).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No stockflow.toml found at {}.", config_path.display());
            }
            let warnings = effective.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("stockflow.toml already exists at {}", config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            StockflowConfig::sample().save(config_path)?;

            println!("Created stockflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] port, db_path");
            println!("  - [erp] base_url, company_db, username, password");
            println!("  - [client] base_url, user_id, role, page_size");
            println!("  - [catalog] offline items and serials used without an ERP");
            println!();
        }
    }

    Ok(())
}
