use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use stockflow_common::{
    CatalogItem, Effect, LineQcStatus, ListQuery, Outcome, Page, Pagination, Priority, Scope,
    SerialNumber, StatusChange, Transfer, TransferDetail, TransferItem, TransferItemDetail,
    TransferStatus, TransferSummary,
};

use crate::errors::TransferError;

/// Async-safe handle to the transfer database.
///
/// Wraps `TransferDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TransferDb>>,
}

impl DbHandle {
    pub fn new(db: TransferDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, TransferError>
    where
        F: FnOnce(&TransferDb) -> Result<R, TransferError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| TransferError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct TransferDb {
    conn: Connection,
}

const TRANSFER_COLUMNS: &str = "t.id, t.transfer_number, t.source, t.destination, t.status, \
     t.priority, t.notes, t.owner_id, t.qc_notes, t.qc_reviewer_id, t.qc_reviewed_at, \
     t.erp_document_number, t.created_at, t.updated_at";

const ITEM_COLUMNS: &str = "id, transfer_id, line_number, item_code, item_description, quantity, \
     batch_number, serial_tracked, qc_status, created_at";

impl TransferDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing and ephemeral servers).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS transfers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transfer_number TEXT NOT NULL UNIQUE,
                    source TEXT NOT NULL,
                    destination TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    priority TEXT NOT NULL DEFAULT 'normal',
                    notes TEXT NOT NULL DEFAULT '',
                    owner_id INTEGER NOT NULL,
                    qc_notes TEXT,
                    qc_reviewer_id INTEGER,
                    qc_reviewed_at TEXT,
                    erp_document_number TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    CHECK (source <> destination)
                );

                CREATE TABLE IF NOT EXISTS transfer_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transfer_id INTEGER NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
                    line_number INTEGER NOT NULL,
                    item_code TEXT NOT NULL,
                    item_description TEXT NOT NULL DEFAULT '',
                    quantity REAL NOT NULL CHECK (quantity > 0),
                    batch_number TEXT,
                    serial_tracked INTEGER NOT NULL DEFAULT 0,
                    qc_status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(transfer_id, item_code)
                );

                CREATE TABLE IF NOT EXISTS transfer_serials (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    item_id INTEGER NOT NULL REFERENCES transfer_items(id) ON DELETE CASCADE,
                    serial TEXT NOT NULL,
                    system_number INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(item_id, serial)
                );

                CREATE TABLE IF NOT EXISTS transfer_status_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transfer_id INTEGER NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
                    from_status TEXT,
                    to_status TEXT NOT NULL,
                    action TEXT,
                    changed_by INTEGER NOT NULL,
                    reason TEXT,
                    changed_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_transfers_owner ON transfers(owner_id);
                CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);
                CREATE INDEX IF NOT EXISTS idx_transfer_items_transfer ON transfer_items(transfer_id);
                CREATE INDEX IF NOT EXISTS idx_transfer_serials_item ON transfer_serials(item_id);
                CREATE INDEX IF NOT EXISTS idx_transfer_history_transfer ON transfer_status_history(transfer_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Transfers ─────────────────────────────────────────────────────

    /// Insert a draft transfer owned by `owner_id`. When no transfer number
    /// is supplied one is derived from the row id.
    pub fn create_transfer(
        &self,
        owner_id: i64,
        source: &str,
        destination: &str,
        notes: &str,
        priority: Priority,
        transfer_number: Option<&str>,
    ) -> Result<Transfer, TransferError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let provisional = match transfer_number {
            Some(n) => n.to_string(),
            None => format!("PENDING-{}", uuid::Uuid::new_v4()),
        };
        tx.execute(
            "INSERT INTO transfers (transfer_number, source, destination, notes, priority, owner_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![provisional, source, destination, notes, priority.as_str(), owner_id],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                TransferError::Conflict(format!("transfer number {} already exists", provisional))
            } else {
                TransferError::Other(anyhow::Error::new(e).context("Failed to insert transfer"))
            }
        })?;
        let id = tx.last_insert_rowid();

        if transfer_number.is_none() {
            let generated = format!("TR-{}-{:05}", chrono::Utc::now().format("%Y%m%d"), id);
            tx.execute(
                "UPDATE transfers SET transfer_number = ?1 WHERE id = ?2",
                params![generated, id],
            )
            .context("Failed to assign transfer number")?;
        }

        tx.execute(
            "INSERT INTO transfer_status_history (transfer_id, from_status, to_status, action, changed_by)
             VALUES (?1, NULL, ?2, 'create', ?3)",
            params![id, TransferStatus::Draft.as_str(), owner_id],
        )
        .context("Failed to record creation")?;

        tx.commit().context("Failed to commit transfer insert")?;
        Ok(self
            .get_transfer(id)?
            .context("Transfer not found after insert")?)
    }

    pub fn get_transfer(&self, id: i64) -> Result<Option<Transfer>> {
        let sql = format!("SELECT {} FROM transfers t WHERE t.id = ?1", TRANSFER_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_transfer")?;
        let mut rows = stmt
            .query_map(params![id], read_transfer_row)
            .context("Failed to query transfer")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read transfer row")?;
                Ok(Some(r.into_transfer()?))
            }
            None => Ok(None),
        }
    }

    /// Transfer with its items, their serials and the status history.
    pub fn get_transfer_detail(&self, id: i64) -> Result<Option<TransferDetail>> {
        let Some(transfer) = self.get_transfer(id)? else {
            return Ok(None);
        };
        let mut items = Vec::new();
        for item in self.list_items(id)? {
            let serials = self.list_serials(item.id)?;
            items.push(TransferItemDetail { item, serials });
        }
        let history = self.history(id)?;
        Ok(Some(TransferDetail {
            transfer,
            items,
            history,
        }))
    }

    /// One page of transfer summaries, newest first.
    ///
    /// The search term matches the transfer number, locations, notes,
    /// status and the codes of the transfer's items.
    pub fn list_transfers(&self, query: &ListQuery, actor_id: i64) -> Result<Page<TransferSummary>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if query.scope == Scope::Mine {
            args.push(Value::Integer(actor_id));
            clauses.push(format!("t.owner_id = ?{}", args.len()));
        }
        if let Some(term) = query.search_term() {
            args.push(Value::Text(format!("%{}%", term)));
            let n = args.len();
            clauses.push(format!(
                "(t.transfer_number LIKE ?{n} OR t.source LIKE ?{n} OR t.destination LIKE ?{n} \
                 OR t.notes LIKE ?{n} OR t.status LIKE ?{n} OR EXISTS (SELECT 1 FROM transfer_items i \
                 WHERE i.transfer_id = t.id AND i.item_code LIKE ?{n}))"
            ));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM transfers t {}", where_sql),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )
            .context("Failed to count transfers")?;

        let limit_idx = args.len() + 1;
        args.push(Value::Integer(i64::from(query.page_size)));
        args.push(Value::Integer(
            i64::try_from(query.offset()).context("Page offset out of range")?,
        ));
        let sql = format!(
            "SELECT {}, (SELECT COUNT(*) FROM transfer_items i WHERE i.transfer_id = t.id)
             FROM transfers t {}
             ORDER BY t.created_at DESC, t.id DESC
             LIMIT ?{} OFFSET ?{}",
            TRANSFER_COLUMNS,
            where_sql,
            limit_idx,
            limit_idx + 1
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_transfers")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((read_transfer_row(row)?, row.get::<_, i64>(14)?))
            })
            .context("Failed to query transfers")?;

        let mut records = Vec::new();
        for row in rows {
            let (r, items_count) = row.context("Failed to read transfer row")?;
            let transfer = r.into_transfer()?;
            let items_missing_serials = self.missing_serial_codes(transfer.id)?;
            records.push(TransferSummary {
                transfer,
                items_count,
                items_missing_serials,
            });
        }

        Ok(Page {
            records,
            pagination: Pagination::new(
                query.page,
                query.page_size,
                u64::try_from(total).unwrap_or(0),
            ),
        })
    }

    /// Codes of serial-tracked items on the transfer with no serial yet.
    pub fn missing_serial_codes(&self, transfer_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT i.item_code FROM transfer_items i
                 WHERE i.transfer_id = ?1 AND i.serial_tracked = 1
                   AND NOT EXISTS (SELECT 1 FROM transfer_serials s WHERE s.item_id = i.id)
                 ORDER BY i.line_number",
            )
            .context("Failed to prepare missing_serial_codes")?;
        let rows = stmt
            .query_map(params![transfer_id], |row| row.get::<_, String>(0))
            .context("Failed to query missing serials")?;
        let mut codes = Vec::new();
        for row in rows {
            codes.push(row.context("Failed to read item code")?);
        }
        Ok(codes)
    }

    /// Delete a transfer while it is still a draft. Returns false when no
    /// draft with that id exists.
    pub fn delete_draft_transfer(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM transfers WHERE id = ?1 AND status = ?2",
                params![id, TransferStatus::Draft.as_str()],
            )
            .context("Failed to delete transfer")?;
        Ok(count > 0)
    }

    fn touch_transfer(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE transfers SET updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to touch transfer")?;
        Ok(())
    }

    /// Persist an accepted transition and its effects in one transaction.
    ///
    /// The status update is guarded on the status the gate evaluated; if
    /// another writer moved the transfer first nothing is applied and
    /// `Conflict` is returned.
    pub fn apply_transition(
        &self,
        transfer_id: i64,
        outcome: &Outcome,
        actor_id: i64,
        reason: Option<&str>,
        erp_document_number: Option<&str>,
    ) -> Result<Transfer, TransferError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let updated = tx
            .execute(
                "UPDATE transfers SET status = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = ?3",
                params![outcome.to.as_str(), transfer_id, outcome.from.as_str()],
            )
            .context("Failed to update transfer status")?;
        if updated == 0 {
            return Err(TransferError::Conflict(format!(
                "transfer {} is no longer {}",
                transfer_id, outcome.from
            )));
        }

        for effect in &outcome.effects {
            match effect {
                Effect::ClearQcNotes => {
                    tx.execute(
                        "UPDATE transfers SET qc_notes = NULL WHERE id = ?1",
                        params![transfer_id],
                    )
                    .context("Failed to clear QC notes")?;
                }
                Effect::SetQcNotes(notes) => {
                    tx.execute(
                        "UPDATE transfers SET qc_notes = ?1 WHERE id = ?2",
                        params![notes, transfer_id],
                    )
                    .context("Failed to store QC notes")?;
                }
                Effect::StampReviewer => {
                    tx.execute(
                        "UPDATE transfers SET qc_reviewer_id = ?1, qc_reviewed_at = datetime('now')
                         WHERE id = ?2",
                        params![actor_id, transfer_id],
                    )
                    .context("Failed to stamp QC reviewer")?;
                }
                Effect::ClearReviewer => {
                    tx.execute(
                        "UPDATE transfers SET qc_reviewer_id = NULL, qc_reviewed_at = NULL
                         WHERE id = ?1",
                        params![transfer_id],
                    )
                    .context("Failed to clear QC reviewer")?;
                }
                Effect::SetLineQc(status) => {
                    tx.execute(
                        "UPDATE transfer_items SET qc_status = ?1 WHERE transfer_id = ?2",
                        params![status.as_str(), transfer_id],
                    )
                    .context("Failed to update line QC status")?;
                }
            }
        }

        if let Some(doc) = erp_document_number {
            tx.execute(
                "UPDATE transfers SET erp_document_number = ?1 WHERE id = ?2",
                params![doc, transfer_id],
            )
            .context("Failed to store ERP document number")?;
        }

        tx.execute(
            "INSERT INTO transfer_status_history (transfer_id, from_status, to_status, action, changed_by, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                transfer_id,
                outcome.from.as_str(),
                outcome.to.as_str(),
                outcome.action.as_str(),
                actor_id,
                reason
            ],
        )
        .context("Failed to record status change")?;

        tx.commit().context("Failed to commit transition")?;
        Ok(self
            .get_transfer(transfer_id)?
            .context("Transfer not found after transition")?)
    }

    pub fn history(&self, transfer_id: i64) -> Result<Vec<StatusChange>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, transfer_id, from_status, to_status, action, changed_by, reason, changed_at
                 FROM transfer_status_history WHERE transfer_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare history")?;
        let rows = stmt
            .query_map(params![transfer_id], |row| {
                Ok(StatusChangeRow {
                    id: row.get(0)?,
                    transfer_id: row.get(1)?,
                    from_status: row.get(2)?,
                    to_status: row.get(3)?,
                    action: row.get(4)?,
                    changed_by: row.get(5)?,
                    reason: row.get(6)?,
                    changed_at: row.get(7)?,
                })
            })
            .context("Failed to query history")?;
        let mut changes = Vec::new();
        for row in rows {
            let r = row.context("Failed to read history row")?;
            changes.push(r.into_status_change()?);
        }
        Ok(changes)
    }

    // ── Items ─────────────────────────────────────────────────────────

    pub fn list_items(&self, transfer_id: i64) -> Result<Vec<TransferItem>> {
        let sql = format!(
            "SELECT {} FROM transfer_items WHERE transfer_id = ?1 ORDER BY line_number",
            ITEM_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_items")?;
        let rows = stmt
            .query_map(params![transfer_id], read_item_row)
            .context("Failed to query items")?;
        let mut items = Vec::new();
        for row in rows {
            let r = row.context("Failed to read item row")?;
            items.push(r.into_item()?);
        }
        Ok(items)
    }

    pub fn get_item(&self, id: i64) -> Result<Option<TransferItem>> {
        let sql = format!("SELECT {} FROM transfer_items WHERE id = ?1", ITEM_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_item")?;
        let mut rows = stmt
            .query_map(params![id], read_item_row)
            .context("Failed to query item")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read item row")?;
                Ok(Some(r.into_item()?))
            }
            None => Ok(None),
        }
    }

    /// Append a line to the transfer. The line number follows the current
    /// last line, so insertion order is line order.
    pub fn insert_item(
        &self,
        transfer_id: i64,
        catalog: &CatalogItem,
        quantity: f64,
        batch_number: Option<&str>,
    ) -> Result<TransferItem, TransferError> {
        let max_line: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(line_number), 0) FROM transfer_items WHERE transfer_id = ?1",
                params![transfer_id],
                |row| row.get(0),
            )
            .context("Failed to get max line number")?;

        let count = self
            .conn
            .execute(
                "INSERT INTO transfer_items
                    (transfer_id, line_number, item_code, item_description, quantity, batch_number, serial_tracked)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                 WHERE EXISTS (SELECT 1 FROM transfers WHERE id = ?1 AND status = 'draft')",
                params![
                    transfer_id,
                    max_line + 1,
                    catalog.code,
                    catalog.description,
                    quantity,
                    batch_number,
                    catalog.serial_tracked
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    TransferError::validation(
                        "item_code",
                        format!("item {} is already on this transfer", catalog.code),
                    )
                } else {
                    TransferError::Other(anyhow::Error::new(e).context("Failed to insert item"))
                }
            })?;
        if count == 0 {
            return Err(self.refused_write(transfer_id));
        }
        let id = self.conn.last_insert_rowid();
        self.touch_transfer(transfer_id)?;
        Ok(self.get_item(id)?.context("Item not found after insert")?)
    }

    /// Delete a line while its transfer is a draft. Returns false when the
    /// item does not exist.
    pub fn delete_item(&self, id: i64) -> Result<bool, TransferError> {
        let Some(item) = self.get_item(id)? else {
            return Ok(false);
        };
        let count = self
            .conn
            .execute(
                "DELETE FROM transfer_items WHERE id = ?1 AND EXISTS (
                    SELECT 1 FROM transfers t
                    WHERE t.id = transfer_items.transfer_id AND t.status = 'draft')",
                params![id],
            )
            .context("Failed to delete item")?;
        if count == 0 {
            return Err(self.refused_write(item.transfer_id));
        }
        self.touch_transfer(item.transfer_id)?;
        Ok(true)
    }

    // ── Serials ───────────────────────────────────────────────────────

    pub fn list_serials(&self, item_id: i64) -> Result<Vec<SerialNumber>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, item_id, serial, system_number, created_at
                 FROM transfer_serials WHERE item_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_serials")?;
        let rows = stmt
            .query_map(params![item_id], read_serial)
            .context("Failed to query serials")?;
        let mut serials = Vec::new();
        for row in rows {
            serials.push(row.context("Failed to read serial row")?);
        }
        Ok(serials)
    }

    pub fn get_serial(&self, id: i64) -> Result<Option<SerialNumber>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, item_id, serial, system_number, created_at
                 FROM transfer_serials WHERE id = ?1",
            )
            .context("Failed to prepare get_serial")?;
        let mut rows = stmt
            .query_map(params![id], read_serial)
            .context("Failed to query serial")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read serial row")?)),
            None => Ok(None),
        }
    }

    /// Attach a validated serial to an item. The (item, serial) unique
    /// constraint is the authority on duplicates.
    pub fn insert_serial(
        &self,
        item_id: i64,
        serial: &str,
        system_number: Option<i64>,
    ) -> Result<SerialNumber, TransferError> {
        let count = self
            .conn
            .execute(
                "INSERT INTO transfer_serials (item_id, serial, system_number)
                 SELECT ?1, ?2, ?3
                 WHERE EXISTS (
                    SELECT 1 FROM transfer_items i JOIN transfers t ON t.id = i.transfer_id
                    WHERE i.id = ?1 AND t.status = 'draft')",
                params![item_id, serial, system_number],
            )
            .map_err(|e| serial_write_error(e, item_id, serial))?;
        if count == 0 {
            return Err(self.refused_item_write(item_id));
        }
        let id = self.conn.last_insert_rowid();
        self.touch_item_transfer(item_id)?;
        Ok(self.get_serial(id)?.context("Serial not found after insert")?)
    }

    pub fn update_serial(
        &self,
        id: i64,
        serial: &str,
        system_number: Option<i64>,
    ) -> Result<SerialNumber, TransferError> {
        let existing = self
            .get_serial(id)?
            .ok_or_else(|| TransferError::not_found("Serial", id))?;
        let count = self
            .conn
            .execute(
                "UPDATE transfer_serials SET serial = ?1, system_number = ?2
                 WHERE id = ?3 AND EXISTS (
                    SELECT 1 FROM transfer_items i JOIN transfers t ON t.id = i.transfer_id
                    WHERE i.id = transfer_serials.item_id AND t.status = 'draft')",
                params![serial, system_number, id],
            )
            .map_err(|e| serial_write_error(e, existing.item_id, serial))?;
        if count == 0 {
            return Err(self.refused_item_write(existing.item_id));
        }
        self.touch_item_transfer(existing.item_id)?;
        Ok(self.get_serial(id)?.context("Serial not found after update")?)
    }

    /// Detach a serial while its transfer is a draft. Returns false when
    /// the serial does not exist.
    pub fn delete_serial(&self, id: i64) -> Result<bool, TransferError> {
        let Some(existing) = self.get_serial(id)? else {
            return Ok(false);
        };
        let count = self
            .conn
            .execute(
                "DELETE FROM transfer_serials WHERE id = ?1 AND EXISTS (
                    SELECT 1 FROM transfer_items i JOIN transfers t ON t.id = i.transfer_id
                    WHERE i.id = transfer_serials.item_id AND t.status = 'draft')",
                params![id],
            )
            .context("Failed to delete serial")?;
        if count == 0 {
            return Err(self.refused_item_write(existing.item_id));
        }
        self.touch_item_transfer(existing.item_id)?;
        Ok(true)
    }

    fn touch_item_transfer(&self, item_id: i64) -> Result<()> {
        if let Some(item) = self.get_item(item_id)? {
            self.touch_transfer(item.transfer_id)?;
        }
        Ok(())
    }

    /// Why a draft-guarded write on this transfer changed nothing.
    fn refused_write(&self, transfer_id: i64) -> TransferError {
        match self.get_transfer(transfer_id) {
            Ok(Some(transfer)) => TransferError::NotEditable {
                transfer_id,
                status: transfer.status,
            },
            Ok(None) => TransferError::not_found("Transfer", transfer_id),
            Err(e) => TransferError::Other(e),
        }
    }

    fn refused_item_write(&self, item_id: i64) -> TransferError {
        match self.get_item(item_id) {
            Ok(Some(item)) => self.refused_write(item.transfer_id),
            Ok(None) => TransferError::not_found("Item", item_id),
            Err(e) => TransferError::Other(e),
        }
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn serial_write_error(err: rusqlite::Error, item_id: i64, serial: &str) -> TransferError {
    if is_unique_violation(&err) {
        TransferError::DuplicateSerial {
            serial: serial.to_string(),
            item_id,
        }
    } else {
        TransferError::Other(anyhow::Error::new(err).context("Failed to write serial"))
    }
}

fn read_serial(row: &rusqlite::Row<'_>) -> rusqlite::Result<SerialNumber> {
    Ok(SerialNumber {
        id: row.get(0)?,
        item_id: row.get(1)?,
        serial: row.get(2)?,
        system_number: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Intermediate row struct for reading transfers before converting the
/// status and priority strings into typed values.
struct TransferRow {
    id: i64,
    transfer_number: String,
    source: String,
    destination: String,
    status: String,
    priority: String,
    notes: String,
    owner_id: i64,
    qc_notes: Option<String>,
    qc_reviewer_id: Option<i64>,
    qc_reviewed_at: Option<String>,
    erp_document_number: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_transfer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRow> {
    Ok(TransferRow {
        id: row.get(0)?,
        transfer_number: row.get(1)?,
        source: row.get(2)?,
        destination: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        notes: row.get(6)?,
        owner_id: row.get(7)?,
        qc_notes: row.get(8)?,
        qc_reviewer_id: row.get(9)?,
        qc_reviewed_at: row.get(10)?,
        erp_document_number: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl TransferRow {
    fn into_transfer(self) -> Result<Transfer> {
        let status = TransferStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse transfer status")?;
        let priority = Priority::from_str(&self.priority)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse transfer priority")?;
        Ok(Transfer {
            id: self.id,
            transfer_number: self.transfer_number,
            source: self.source,
            destination: self.destination,
            status,
            priority,
            notes: self.notes,
            owner_id: self.owner_id,
            qc_notes: self.qc_notes,
            qc_reviewer_id: self.qc_reviewer_id,
            qc_reviewed_at: self.qc_reviewed_at,
            erp_document_number: self.erp_document_number,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ItemRow {
    id: i64,
    transfer_id: i64,
    line_number: i32,
    item_code: String,
    item_description: String,
    quantity: f64,
    batch_number: Option<String>,
    serial_tracked: bool,
    qc_status: String,
    created_at: String,
}

fn read_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        transfer_id: row.get(1)?,
        line_number: row.get(2)?,
        item_code: row.get(3)?,
        item_description: row.get(4)?,
        quantity: row.get(5)?,
        batch_number: row.get(6)?,
        serial_tracked: row.get(7)?,
        qc_status: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl ItemRow {
    fn into_item(self) -> Result<TransferItem> {
        let qc_status = LineQcStatus::from_str(&self.qc_status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse line QC status")?;
        Ok(TransferItem {
            id: self.id,
            transfer_id: self.transfer_id,
            line_number: self.line_number,
            item_code: self.item_code,
            item_description: self.item_description,
            quantity: self.quantity,
            batch_number: self.batch_number,
            serial_tracked: self.serial_tracked,
            qc_status,
            created_at: self.created_at,
        })
    }
}

struct StatusChangeRow {
    id: i64,
    transfer_id: i64,
    from_status: Option<String>,
    to_status: String,
    action: Option<String>,
    changed_by: i64,
    reason: Option<String>,
    changed_at: String,
}

impl StatusChangeRow {
    fn into_status_change(self) -> Result<StatusChange> {
        let from_status = self
            .from_status
            .as_deref()
            .map(TransferStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse history from_status")?;
        let to_status = TransferStatus::from_str(&self.to_status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse history to_status")?;
        Ok(StatusChange {
            id: self.id,
            transfer_id: self.transfer_id,
            from_status,
            to_status,
            action: self.action,
            changed_by: self.changed_by,
            reason: self.reason,
            changed_at: self.changed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
