//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                   |
//! |-------------|----------------------------------------------------|
//! | `serve`     | `Serve`                                            |
//! | `config`    | `Config`                                           |
//! | `transfers` | `Whoami`, `Transfers`                              |
//! | `items`     | `Items`, `Serials`, `Catalog`                      |

pub mod config;
pub mod items;
pub mod serve;
pub mod transfers;

pub use config::cmd_config;
pub use items::{cmd_catalog, cmd_items, cmd_serials};
pub use serve::cmd_serve;
pub use transfers::{cmd_transfers, cmd_whoami};

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use stockflow::client::{SyncClient, SyncError};
use stockflow::config::StockflowConfig;
use stockflow_common::Actor;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the configured server, acting as the configured user.
pub(crate) fn client(config: &StockflowConfig) -> Result<(SyncClient, Actor)> {
    let client = SyncClient::from_config(&config.client, CLIENT_TIMEOUT)?;
    let Some(actor) = client.actor() else {
        anyhow::bail!("No user configured. Pass --as-user <ID> or set [client] user_id.");
    };
    Ok((client, actor))
}

/// Turn a sync failure into a CLI error that names its kind.
pub(crate) fn report(err: SyncError) -> anyhow::Error {
    match &err.field {
        Some(field) => anyhow::anyhow!("{} [{}: {}]", err.message, err.kind, field),
        None => anyhow::anyhow!("{} [{}]", err.message, err.kind),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
