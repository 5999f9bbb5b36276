use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::status::{LineQcStatus, Priority, Role, TransferStatus};

/// Page sizes a list view may request.
pub const PAGE_SIZES: [u32; 4] = [10, 25, 50, 100];
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// The acting user, as returned by the current-user lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: i64,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: i64, role: Role) -> Self {
        Self { user_id, role }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub transfer_number: String,
    pub source: String,
    pub destination: String,
    pub status: TransferStatus,
    pub priority: Priority,
    pub notes: String,
    pub owner_id: i64,
    pub qc_notes: Option<String>,
    pub qc_reviewer_id: Option<i64>,
    pub qc_reviewed_at: Option<String>,
    pub erp_document_number: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: i64,
    pub transfer_id: i64,
    pub line_number: i32,
    pub item_code: String,
    pub item_description: String,
    pub quantity: f64,
    pub batch_number: Option<String>,
    pub serial_tracked: bool,
    pub qc_status: LineQcStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialNumber {
    pub id: i64,
    pub item_id: i64,
    pub serial: String,
    pub system_number: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItemDetail {
    #[serde(flatten)]
    pub item: TransferItem,
    pub serials: Vec<SerialNumber>,
}

impl TransferItemDetail {
    /// Serial-tracked and still without any serial number.
    pub fn is_missing_serials(&self) -> bool {
        self.item.serial_tracked && self.serials.is_empty()
    }
}

/// One row of the transfer status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: i64,
    pub transfer_id: i64,
    pub from_status: Option<TransferStatus>,
    pub to_status: TransferStatus,
    pub action: Option<String>,
    pub changed_by: i64,
    pub reason: Option<String>,
    pub changed_at: String,
}

/// List-view projection. The counts are derived from the child rows at
/// query time and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSummary {
    #[serde(flatten)]
    pub transfer: Transfer,
    pub items_count: i64,
    #[serde(default)]
    pub items_missing_serials: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDetail {
    #[serde(flatten)]
    pub transfer: Transfer,
    pub items: Vec<TransferItemDetail>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
}

impl TransferDetail {
    pub fn items_count(&self) -> usize {
        self.items.len()
    }

    pub fn items_missing_serials(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.is_missing_serials())
            .map(|i| i.item.item_code.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    All,
    #[default]
    Mine,
}

/// Filter and paging state for a transfer list request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub scope: Scope,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
            search: None,
            scope: Scope::default(),
        }
    }
}

impl ListQuery {
    /// Check page and page size bounds. Returns the offending field name.
    pub fn validate(&self) -> Result<(), (&'static str, String)> {
        if self.page < 1 {
            return Err(("page", "page must be 1 or greater".to_string()));
        }
        if !PAGE_SIZES.contains(&self.page_size) {
            return Err((
                "page_size",
                format!("page_size must be one of {:?}", PAGE_SIZES),
            ));
        }
        Ok(())
    }

    /// Search text with surrounding whitespace removed, or `None` if blank.
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u32,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32, total_count: u64) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_count.div_ceil(u64::from(page_size)) as u32
        };
        Self {
            page,
            page_size,
            total_count,
            total_pages,
        }
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }

    pub fn has_previous(&self) -> bool {
        self.page > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub pagination: Pagination,
}

// ── Request payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransferRequest {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub transfer_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddItemRequest {
    pub item_code: String,
    pub quantity: f64,
    #[serde(default)]
    pub batch_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialRequest {
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSerialRequest {
    /// Free text; serials are separated by commas or whitespace.
    pub serials: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSerial {
    pub serial: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BulkSerialResult {
    pub accepted: Vec<SerialNumber>,
    pub rejected: Vec<RejectedSerial>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransitionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// ── Catalog / ERP lookups ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub serial_tracked: bool,
    #[serde(default)]
    pub batch_tracked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialCheck {
    pub serial: String,
    pub item_code: String,
    pub location: String,
    pub valid: bool,
    #[serde(default)]
    pub system_number: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warehouse {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinLocation {
    pub code: String,
    pub warehouse: String,
}
