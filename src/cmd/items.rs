//! Item, serial and catalog commands.

use anyhow::Result;
use console::style;
use stockflow::client::TransferApi;
use stockflow::config::StockflowConfig;
use stockflow_common::{AddItemRequest, BulkSerialResult, SerialNumber};

use super::super::{CatalogCommands, ItemCommands, SerialCommands};
use super::{client, print_json, report};

pub async fn cmd_items(config: &StockflowConfig, command: ItemCommands, json: bool) -> Result<()> {
    let (client, _) = client(config)?;

    match command {
        ItemCommands::Add {
            transfer_id,
            item_code,
            quantity,
            batch,
        } => {
            let req = AddItemRequest {
                item_code,
                quantity,
                batch_number: batch,
            };
            let item = client.add_item(transfer_id, &req).await.map_err(report)?;
            if json {
                return print_json(&item);
            }
            println!(
                "Added line #{} [{}] {} {} x{}",
                item.line_number,
                item.id,
                style(&item.item_code).bold(),
                item.item_description,
                item.quantity
            );
            if item.serial_tracked {
                println!(
                    "  {} serial-tracked: add serials with `stockflow serials add {} <SERIAL>...`",
                    style("⚠").yellow(),
                    item.id
                );
            }
        }
        ItemCommands::Remove { item_id } => {
            client.remove_item(item_id).await.map_err(report)?;
            println!("Removed item {}", item_id);
        }
    }

    Ok(())
}

pub async fn cmd_serials(
    config: &StockflowConfig,
    command: SerialCommands,
    json: bool,
) -> Result<()> {
    let (client, _) = client(config)?;

    match command {
        SerialCommands::List { item_id } => {
            let serials = client.list_serials(item_id).await.map_err(report)?;
            if json {
                return print_json(&serials);
            }
            if serials.is_empty() {
                println!("No serials on item {}.", item_id);
            }
            for serial in &serials {
                print_serial(serial);
            }
        }
        SerialCommands::Add { item_id, serials } => {
            if let [single] = serials.as_slice() {
                let serial = client.add_serial(item_id, single).await.map_err(report)?;
                if json {
                    return print_json(&serial);
                }
                print!("Added ");
                print_serial(&serial);
            } else {
                let result = client
                    .add_serials_bulk(item_id, &serials.join("\n"))
                    .await
                    .map_err(report)?;
                if json {
                    return print_json(&result);
                }
                print_bulk(&result);
            }
        }
        SerialCommands::Edit { serial_id, serial } => {
            let serial = client
                .edit_serial(serial_id, &serial)
                .await
                .map_err(report)?;
            if json {
                return print_json(&serial);
            }
            print!("Updated ");
            print_serial(&serial);
        }
        SerialCommands::Remove { serial_id } => {
            client.remove_serial(serial_id).await.map_err(report)?;
            println!("Removed serial {}", serial_id);
        }
    }

    Ok(())
}

pub async fn cmd_catalog(
    config: &StockflowConfig,
    command: CatalogCommands,
    json: bool,
) -> Result<()> {
    let (client, _) = client(config)?;

    match command {
        CatalogCommands::Item { code } => {
            let item = client.resolve_item(&code).await.map_err(report)?;
            if json {
                return print_json(&item);
            }
            println!("{}  {}", style(&item.code).bold(), item.description);
            if item.serial_tracked {
                println!("  serial-tracked");
            }
            if item.batch_tracked {
                println!("  batch-tracked");
            }
        }
        CatalogCommands::Serial {
            item_code,
            serial,
            location,
        } => {
            let check = client
                .validate_serial(&item_code, &serial, &location)
                .await
                .map_err(report)?;
            if json {
                return print_json(&check);
            }
            if check.valid {
                println!(
                    "{} {} is available for {} at {}",
                    style("✓").green(),
                    check.serial,
                    check.item_code,
                    check.location
                );
            } else {
                println!(
                    "{} {}: {}",
                    style("✗").red(),
                    check.serial,
                    check.message.as_deref().unwrap_or("not valid at this location")
                );
            }
        }
    }

    Ok(())
}

fn print_serial(serial: &SerialNumber) {
    println!(
        "[{}] {}{}",
        serial.id,
        style(&serial.serial).bold(),
        serial
            .system_number
            .map(|n| format!("  (system #{})", n))
            .unwrap_or_default()
    );
}

fn print_bulk(result: &BulkSerialResult) {
    println!(
        "{} accepted, {} rejected",
        style(result.accepted.len()).green(),
        style(result.rejected.len()).red()
    );
    for serial in &result.accepted {
        print!("  {} ", style("✓").green());
        print_serial(serial);
    }
    for rejected in &result.rejected {
        println!(
            "  {} {}: {} [{}]",
            style("✗").red(),
            rejected.serial,
            rejected.message,
            rejected.kind
        );
    }
}
