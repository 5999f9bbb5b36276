//! Transfer commands: `stockflow whoami` and `stockflow transfers`.

use anyhow::Result;
use console::style;
use stockflow::client::{ListCoordinator, RowView, TransferApi};
use stockflow::config::StockflowConfig;
use stockflow_common::{
    CreateTransferRequest, Scope, StatusChange, Transfer, TransferAction, TransferDetail,
    TransferStatus,
};

use super::super::TransferCommands;
use super::{client, print_json, report};

pub async fn cmd_whoami(config: &StockflowConfig, json: bool) -> Result<()> {
    let (client, _) = client(config)?;
    let actor = client.me().await.map_err(report)?;
    if json {
        return print_json(&actor);
    }
    println!(
        "User {} ({}) at {}",
        style(actor.user_id).bold(),
        actor.role,
        config.client.base_url
    );
    Ok(())
}

pub async fn cmd_transfers(
    config: &StockflowConfig,
    command: TransferCommands,
    json: bool,
) -> Result<()> {
    let (client, actor) = client(config)?;

    match command {
        TransferCommands::List {
            page,
            page_size,
            search,
            all,
        } => {
            let mut list = ListCoordinator::new(client, actor);
            list.set_page_size(page_size.unwrap_or(config.client.page_size))
                .map_err(report)?;
            if let Some(search) = search {
                list.set_search(search);
            }
            if all {
                list.set_scope(Scope::All);
            }
            list.change_page(page).await.map_err(report)?;

            let rows = list.rows();
            if json {
                return print_json(&rows_json(&rows));
            }
            if rows.is_empty() {
                println!("No transfers found.");
                return Ok(());
            }
            println!();
            for row in &rows {
                print_row(row);
            }
            if let Some(p) = list.pagination() {
                println!();
                println!(
                    "{}",
                    style(format!(
                        "Page {} of {} ({} transfers)",
                        p.page,
                        p.total_pages.max(1),
                        p.total_count
                    ))
                    .dim()
                );
            }
        }
        TransferCommands::Show { id } => {
            let detail = client.get(id).await.map_err(report)?;
            if json {
                return print_json(&detail);
            }
            print_detail(&detail);
        }
        TransferCommands::Create {
            source,
            destination,
            notes,
            priority,
            number,
        } => {
            let req = CreateTransferRequest {
                source,
                destination,
                notes,
                priority,
                transfer_number: number,
            };
            let transfer = client.create(&req).await.map_err(report)?;
            if json {
                return print_json(&transfer);
            }
            println!(
                "Created {} (id {}): {} -> {}",
                style(&transfer.transfer_number).bold(),
                transfer.id,
                transfer.source,
                transfer.destination
            );
        }
        TransferCommands::Delete { id } => {
            client.delete(id).await.map_err(report)?;
            println!("Deleted transfer {}", id);
        }
        TransferCommands::Submit { id } => {
            let t = client.submit(id).await.map_err(report)?;
            print_transition(&t, TransferAction::Submit, json)?;
        }
        TransferCommands::Approve { id } => {
            let t = client.qc_approve(id).await.map_err(report)?;
            print_transition(&t, TransferAction::QcApprove, json)?;
        }
        TransferCommands::Reject { id, reason } => {
            let t = client.qc_reject(id, &reason).await.map_err(report)?;
            print_transition(&t, TransferAction::QcReject, json)?;
        }
        TransferCommands::Post { id } => {
            let t = client.post(id).await.map_err(report)?;
            print_transition(&t, TransferAction::Post, json)?;
        }
        TransferCommands::Reopen { id } => {
            let t = client.reopen(id).await.map_err(report)?;
            print_transition(&t, TransferAction::Reopen, json)?;
        }
        TransferCommands::History { id } => {
            let history = client.history(id).await.map_err(report)?;
            if json {
                return print_json(&history);
            }
            print_history(&history);
        }
    }

    Ok(())
}

fn rows_json(rows: &[RowView]) -> Vec<serde_json::Value> {
    rows.iter()
        .map(|row| {
            serde_json::json!({
                "transfer": row.summary,
                "editable": row.editable,
                "allowed_actions": row.allowed_actions,
            })
        })
        .collect()
}

fn status_label(status: TransferStatus) -> String {
    let text = status.as_str();
    match status {
        TransferStatus::Draft => style(text).cyan().to_string(),
        TransferStatus::Submitted => style(text).yellow().to_string(),
        TransferStatus::QcApproved => style(text).green().to_string(),
        TransferStatus::Rejected => style(text).red().to_string(),
        TransferStatus::Posted => style(text).dim().to_string(),
    }
}

fn print_row(row: &RowView) {
    let t = &row.summary.transfer;
    let actions = if row.allowed_actions.is_empty() {
        style("-").dim().to_string()
    } else {
        row.allowed_actions
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!(
        "  {:>5}  {}  {:<12}  {} -> {}  items: {}  actions: {}{}",
        t.id,
        style(&t.transfer_number).bold(),
        status_label(t.status),
        t.source,
        t.destination,
        row.summary.items_count,
        actions,
        if row.editable { "" } else { "  (read-only)" }
    );
    if !row.summary.items_missing_serials.is_empty() {
        println!(
            "         {} missing serials: {}",
            style("⚠").yellow(),
            row.summary.items_missing_serials.join(", ")
        );
    }
}

fn print_detail(detail: &TransferDetail) {
    let t = &detail.transfer;
    println!();
    println!(
        "{}  {}",
        style(&t.transfer_number).bold(),
        status_label(t.status)
    );
    println!("  {} -> {}  priority: {}", t.source, t.destination, t.priority);
    println!("  owner: {}", t.owner_id);
    if !t.notes.is_empty() {
        println!("  notes: {}", t.notes);
    }
    if let Some(qc) = &t.qc_notes {
        println!("  qc notes: {}", qc);
    }
    if let Some(doc) = &t.erp_document_number {
        println!("  ERP document: {}", style(doc).green());
    }
    println!();
    if detail.items.is_empty() {
        println!("  No items.");
    }
    for line in &detail.items {
        let item = &line.item;
        println!(
            "  #{} [{}] {} {}  x{}{}",
            item.line_number,
            item.id,
            style(&item.item_code).bold(),
            item.item_description,
            item.quantity,
            item.batch_number
                .as_deref()
                .map(|b| format!("  batch {}", b))
                .unwrap_or_default()
        );
        if line.is_missing_serials() {
            println!("      {} serials required", style("⚠").yellow());
        }
        for serial in &line.serials {
            println!("      [{}] {}", serial.id, serial.serial);
        }
    }
    if !detail.history.is_empty() {
        println!();
        print_history(&detail.history);
    }
}

fn print_history(history: &[StatusChange]) {
    for change in history {
        let from = change
            .from_status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {} -> {}  by {}{}",
            style(&change.changed_at).dim(),
            from,
            change.to_status,
            change.changed_by,
            change
                .reason
                .as_deref()
                .map(|r| format!("  ({})", r))
                .unwrap_or_default()
        );
    }
}

fn print_transition(transfer: &Transfer, action: TransferAction, json: bool) -> Result<()> {
    if json {
        return print_json(transfer);
    }
    println!(
        "{} {}: now {}",
        style(action.as_str()).bold(),
        transfer.transfer_number,
        status_label(transfer.status)
    );
    if let Some(doc) = &transfer.erp_document_number
        && action == TransferAction::Post
    {
        println!("  ERP document {}", style(doc).green());
    }
    Ok(())
}
