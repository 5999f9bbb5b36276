//! ERP adapter: item catalog, serial validation, warehouse lookups and
//! stock transfer posting.
//!
//! [`SapErpClient`] talks to an SAP Business One Service Layer.
//! [`InMemoryErp`] serves a fixed catalog from configuration and backs the
//! tests. [`CachedErp`] memoizes item lookups in front of either.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stockflow_common::{BinLocation, CatalogItem, SerialCheck, TransferDetail, Warehouse};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{CatalogConfig, ErpConfig, StockflowConfig};
use crate::errors::TransferError;

/// Everything the transfer service needs from the ERP.
///
/// Transport failures surface as [`TransferError::Unavailable`]. An unknown
/// item code is [`TransferError::NotFound`]; an unacceptable serial is a
/// [`SerialCheck`] with `valid == false`, not an error.
#[async_trait]
pub trait Erp: Send + Sync {
    async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError>;

    /// Check that `serial` exists for `item_code`, is unissued and sits at
    /// `location`.
    async fn validate_serial(
        &self,
        item_code: &str,
        serial: &str,
        location: &str,
    ) -> Result<SerialCheck, TransferError>;

    async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError>;

    async fn bins(&self, warehouse: &str) -> Result<Vec<BinLocation>, TransferError>;

    /// Create the stock transfer document. Returns the ERP document number.
    async fn post_transfer(&self, detail: &TransferDetail) -> Result<String, TransferError>;
}

/// Build the configured ERP adapter, wrapped in the item cache.
pub fn build_erp(config: &StockflowConfig) -> anyhow::Result<Arc<dyn Erp>> {
    let ttl = Duration::from_secs(config.erp.cache_ttl_secs);
    let inner: Arc<dyn Erp> = match config.erp.base_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            info!(base_url = url, "Using SAP Business One Service Layer");
            Arc::new(SapErpClient::new(&config.erp)?)
        }
        _ => {
            info!(
                items = config.catalog.items.len(),
                serials = config.catalog.serials.len(),
                "No ERP configured; serving the offline catalog"
            );
            Arc::new(InMemoryErp::from_catalog(&config.catalog))
        }
    };
    Ok(Arc::new(CachedErp::new(inner, ttl)))
}

fn invalid(item_code: &str, serial: &str, location: &str, message: String) -> SerialCheck {
    SerialCheck {
        serial: serial.to_string(),
        item_code: item_code.to_string(),
        location: location.to_string(),
        valid: false,
        system_number: None,
        message: Some(message),
    }
}

// ── Offline catalog ───────────────────────────────────────────────────

/// A serial number known to the offline catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSerial {
    pub serial: String,
    pub item_code: String,
    pub location: String,
    #[serde(default)]
    pub issued: bool,
    #[serde(default)]
    pub system_number: Option<i64>,
}

#[derive(Default)]
struct Catalog {
    items: HashMap<String, CatalogItem>,
    serials: HashMap<String, CatalogSerial>,
    warehouses: Vec<Warehouse>,
    bins: Vec<BinLocation>,
    next_document: u64,
}

/// ERP stand-in backed by an in-process catalog. Posting a transfer moves
/// its serials to the destination, so a posted serial cannot be validated
/// at the source again.
pub struct InMemoryErp {
    catalog: RwLock<Catalog>,
}

impl Default for InMemoryErp {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryErp {
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog {
                next_document: 1,
                ..Catalog::default()
            }),
        }
    }

    pub fn from_catalog(config: &CatalogConfig) -> Self {
        let mut erp = Self::new();
        for item in &config.items {
            erp = erp.with_item(item.clone());
        }
        for serial in &config.serials {
            erp = erp.with_serial(serial.clone());
        }
        for wh in &config.warehouses {
            erp = erp.with_warehouse(&wh.code, &wh.name);
        }
        for bin in &config.bins {
            erp = erp.with_bin(&bin.warehouse, &bin.code);
        }
        erp
    }

    pub fn with_item(mut self, item: CatalogItem) -> Self {
        self.catalog
            .get_mut()
            .items
            .insert(item.code.clone(), item);
        self
    }

    pub fn with_serial(mut self, serial: CatalogSerial) -> Self {
        self.catalog
            .get_mut()
            .serials
            .insert(serial.serial.clone(), serial);
        self
    }

    pub fn with_warehouse(mut self, code: &str, name: &str) -> Self {
        self.catalog.get_mut().warehouses.push(Warehouse {
            code: code.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_bin(mut self, warehouse: &str, code: &str) -> Self {
        self.catalog.get_mut().bins.push(BinLocation {
            code: code.to_string(),
            warehouse: warehouse.to_string(),
        });
        self
    }
}

#[async_trait]
impl Erp for InMemoryErp {
    async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError> {
        self.catalog
            .read()
            .await
            .items
            .get(code)
            .cloned()
            .ok_or_else(|| TransferError::not_found("Item", code))
    }

    async fn validate_serial(
        &self,
        item_code: &str,
        serial: &str,
        location: &str,
    ) -> Result<SerialCheck, TransferError> {
        let catalog = self.catalog.read().await;
        let Some(known) = catalog.serials.get(serial) else {
            return Ok(invalid(
                item_code,
                serial,
                location,
                format!("serial {} not found", serial),
            ));
        };
        let problem = if known.item_code != item_code {
            Some(format!(
                "serial {} belongs to item {}, not {}",
                serial, known.item_code, item_code
            ))
        } else if known.issued {
            Some(format!("serial {} has already been issued", serial))
        } else if known.location != location {
            Some(format!(
                "serial {} is at {}, not {}",
                serial, known.location, location
            ))
        } else {
            None
        };
        Ok(match problem {
            Some(message) => invalid(item_code, serial, location, message),
            None => SerialCheck {
                serial: serial.to_string(),
                item_code: item_code.to_string(),
                location: location.to_string(),
                valid: true,
                system_number: known.system_number,
                message: None,
            },
        })
    }

    async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError> {
        Ok(self.catalog.read().await.warehouses.clone())
    }

    async fn bins(&self, warehouse: &str) -> Result<Vec<BinLocation>, TransferError> {
        Ok(self
            .catalog
            .read()
            .await
            .bins
            .iter()
            .filter(|b| b.warehouse == warehouse)
            .cloned()
            .collect())
    }

    async fn post_transfer(&self, detail: &TransferDetail) -> Result<String, TransferError> {
        let mut catalog = self.catalog.write().await;
        for item in &detail.items {
            for s in &item.serials {
                if let Some(known) = catalog.serials.get_mut(&s.serial) {
                    known.location = detail.transfer.destination.clone();
                }
            }
        }
        let doc = format!("ST-{:06}", catalog.next_document);
        catalog.next_document += 1;
        Ok(doc)
    }
}

// ── Cache ─────────────────────────────────────────────────────────────

/// Memoizes item lookups per code for a fixed time-to-live. Serial checks
/// and posting always go to the ERP.
pub struct CachedErp {
    inner: Arc<dyn Erp>,
    items: Cache<String, CatalogItem>,
}

impl CachedErp {
    pub fn new(inner: Arc<dyn Erp>, ttl: Duration) -> Self {
        let items = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { inner, items }
    }
}

#[async_trait]
impl Erp for CachedErp {
    async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError> {
        if let Some(hit) = self.items.get(code).await {
            debug!(item_code = code, "Item cache hit");
            return Ok(hit);
        }
        let item = self.inner.resolve_item(code).await?;
        self.items.insert(code.to_string(), item.clone()).await;
        Ok(item)
    }

    async fn validate_serial(
        &self,
        item_code: &str,
        serial: &str,
        location: &str,
    ) -> Result<SerialCheck, TransferError> {
        self.inner.validate_serial(item_code, serial, location).await
    }

    async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError> {
        self.inner.warehouses().await
    }

    async fn bins(&self, warehouse: &str) -> Result<Vec<BinLocation>, TransferError> {
        self.inner.bins(warehouse).await
    }

    async fn post_transfer(&self, detail: &TransferDetail) -> Result<String, TransferError> {
        self.inner.post_transfer(detail).await
    }
}

// ── SAP Business One Service Layer ────────────────────────────────────

const SESSION_COOKIE: &str = "B1SESSION";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoginRequest<'a> {
    #[serde(rename = "CompanyDB")]
    company_db: &'a str,
    user_name: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoginResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ODataList<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SapItem {
    item_code: String,
    #[serde(default)]
    item_name: Option<String>,
    #[serde(default)]
    manage_serial_numbers: Option<String>,
    #[serde(default)]
    manage_batch_numbers: Option<String>,
}

impl SapItem {
    fn into_catalog_item(self) -> CatalogItem {
        CatalogItem {
            code: self.item_code,
            description: self.item_name.unwrap_or_default(),
            serial_tracked: self.manage_serial_numbers.as_deref() == Some("tYES"),
            batch_tracked: self.manage_batch_numbers.as_deref() == Some("tYES"),
        }
    }
}

/// Row of `SerialNumberDetails`. `WhsCode` and `Status` are only present
/// when the Service Layer exposes warehouse placement; `Status` follows the
/// serial-in-warehouse codes where 0 is available.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SapSerial {
    item_code: String,
    serial_number: String,
    #[serde(default)]
    system_number: Option<i64>,
    #[serde(default)]
    whs_code: Option<String>,
    #[serde(default)]
    status: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SapWarehouse {
    warehouse_code: String,
    #[serde(default)]
    warehouse_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SapBin {
    bin_code: String,
    warehouse: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StockTransferDocument {
    from_warehouse: String,
    to_warehouse: String,
    comments: String,
    stock_transfer_lines: Vec<StockTransferLine>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StockTransferLine {
    item_code: String,
    quantity: f64,
    from_warehouse_code: String,
    warehouse_code: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    batch_numbers: Vec<BatchLine>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    serial_numbers: Vec<SerialLine>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BatchLine {
    batch_number: String,
    quantity: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SerialLine {
    internal_serial_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_serial_number: Option<i64>,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StockTransferCreated {
    doc_num: i64,
}

fn stock_transfer_document(detail: &TransferDetail) -> StockTransferDocument {
    let t = &detail.transfer;
    StockTransferDocument {
        from_warehouse: t.source.clone(),
        to_warehouse: t.destination.clone(),
        comments: format!("{} {}", t.transfer_number, t.notes).trim().to_string(),
        stock_transfer_lines: detail
            .items
            .iter()
            .map(|line| StockTransferLine {
                item_code: line.item.item_code.clone(),
                quantity: line.item.quantity,
                from_warehouse_code: t.source.clone(),
                warehouse_code: t.destination.clone(),
                batch_numbers: line
                    .item
                    .batch_number
                    .iter()
                    .map(|b| BatchLine {
                        batch_number: b.clone(),
                        quantity: line.item.quantity,
                    })
                    .collect(),
                serial_numbers: line
                    .serials
                    .iter()
                    .map(|s| SerialLine {
                        internal_serial_number: s.serial.clone(),
                        system_serial_number: s.system_number,
                        quantity: 1.0,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// OData string literal: single quotes are doubled.
fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> TransferError {
    warn!(error = %err, "{}", context);
    TransferError::Unavailable(format!("{}: {}", context, err))
}

/// Client for the SAP Business One Service Layer (`/b1s/v1`).
///
/// Logs in lazily and reuses the `B1SESSION` cookie; an expired session is
/// renewed once per request.
pub struct SapErpClient {
    http: reqwest::Client,
    base_url: String,
    company_db: String,
    username: String,
    password: String,
    session: Mutex<Option<String>>,
}

impl SapErpClient {
    pub fn new(config: &ErpConfig) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .context("ERP base_url is not configured")?
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to build ERP HTTP client")?;
        Ok(Self {
            http,
            base_url,
            company_db: config.company_db.clone().unwrap_or_default(),
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/b1s/v1/{}", self.base_url, path)
    }

    async fn login(&self) -> Result<String, TransferError> {
        debug!(company_db = %self.company_db, "Logging in to Service Layer");
        let resp = self
            .http
            .post(self.url("Login"))
            .json(&LoginRequest {
                company_db: &self.company_db,
                user_name: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|e| unavailable("ERP login failed", e))?;
        if !resp.status().is_success() {
            return Err(unavailable("ERP login rejected", resp.status()));
        }
        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|e| unavailable("ERP login response unreadable", e))?;
        Ok(body.session_id)
    }

    async fn session_id(&self, renew: bool) -> Result<String, TransferError> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref().filter(|_| !renew) {
            return Ok(id.clone());
        }
        let id = self.login().await?;
        *session = Some(id.clone());
        Ok(id)
    }

    /// Send a request with the session cookie, logging in again once if
    /// the session has expired.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, TransferError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let session = self.session_id(false).await?;
        let resp = build(&self.http)
            .header(reqwest::header::COOKIE, format!("{}={}", SESSION_COOKIE, session))
            .send()
            .await
            .map_err(|e| unavailable("ERP request failed", e))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        debug!("ERP session expired, logging in again");
        let session = self.session_id(true).await?;
        build(&self.http)
            .header(reqwest::header::COOKIE, format!("{}={}", SESSION_COOKIE, session))
            .send()
            .await
            .map_err(|e| unavailable("ERP request failed", e))
    }

    /// GET a JSON resource. `Ok(None)` when the ERP answers 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, TransferError> {
        let url = self.url(path);
        debug!(url = %url, "ERP GET");
        let resp = self.send(|http| http.get(&url).query(query)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(unavailable("ERP request returned an error", resp.status()));
        }
        resp.json()
            .await
            .map(Some)
            .map_err(|e| unavailable("ERP response unreadable", e))
    }
}

#[async_trait]
impl Erp for SapErpClient {
    async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError> {
        let path = format!("Items({})", odata_quote(code));
        let query = [(
            "$select",
            "ItemCode,ItemName,ManageSerialNumbers,ManageBatchNumbers".to_string(),
        )];
        self.get_json::<SapItem>(&path, &query)
            .await?
            .map(SapItem::into_catalog_item)
            .ok_or_else(|| TransferError::not_found("Item", code))
    }

    async fn validate_serial(
        &self,
        item_code: &str,
        serial: &str,
        location: &str,
    ) -> Result<SerialCheck, TransferError> {
        let query = [(
            "$filter",
            format!("SerialNumber eq {}", odata_quote(serial)),
        )];
        let found = self
            .get_json::<ODataList<SapSerial>>("SerialNumberDetails", &query)
            .await?
            .map(|l| l.value)
            .unwrap_or_default();

        let Some(row) = found.iter().find(|r| r.item_code == item_code) else {
            let message = match found.first() {
                Some(other) => format!(
                    "serial {} belongs to item {}, not {}",
                    serial, other.item_code, item_code
                ),
                None => format!("serial {} not found in the ERP", serial),
            };
            return Ok(invalid(item_code, serial, location, message));
        };
        if row.status.is_some_and(|s| s != 0) {
            return Ok(invalid(
                item_code,
                serial,
                location,
                format!("serial {} has already been issued", serial),
            ));
        }
        if let Some(whs) = row.whs_code.as_deref().filter(|w| *w != location) {
            return Ok(invalid(
                item_code,
                serial,
                location,
                format!("serial {} is at {}, not {}", serial, whs, location),
            ));
        }
        Ok(SerialCheck {
            serial: row.serial_number.clone(),
            item_code: item_code.to_string(),
            location: location.to_string(),
            valid: true,
            system_number: row.system_number,
            message: None,
        })
    }

    async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError> {
        let query = [("$select", "WarehouseCode,WarehouseName".to_string())];
        Ok(self
            .get_json::<ODataList<SapWarehouse>>("Warehouses", &query)
            .await?
            .map(|l| l.value)
            .unwrap_or_default()
            .into_iter()
            .map(|w| Warehouse {
                name: w.warehouse_name.unwrap_or_else(|| w.warehouse_code.clone()),
                code: w.warehouse_code,
            })
            .collect())
    }

    async fn bins(&self, warehouse: &str) -> Result<Vec<BinLocation>, TransferError> {
        let query = [
            ("$filter", format!("Warehouse eq {}", odata_quote(warehouse))),
            ("$select", "BinCode,Warehouse".to_string()),
        ];
        Ok(self
            .get_json::<ODataList<SapBin>>("BinLocations", &query)
            .await?
            .map(|l| l.value)
            .unwrap_or_default()
            .into_iter()
            .map(|b| BinLocation {
                code: b.bin_code,
                warehouse: b.warehouse,
            })
            .collect())
    }

    async fn post_transfer(&self, detail: &TransferDetail) -> Result<String, TransferError> {
        let url = self.url("StockTransfers");
        let document = stock_transfer_document(detail);
        let resp = self.send(|http| http.post(&url).json(&document)).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(unavailable(
                "ERP refused the stock transfer",
                format!("{} {}", status, body),
            ));
        }
        let created: StockTransferCreated = resp
            .json()
            .await
            .map_err(|e| unavailable("ERP stock transfer response unreadable", e))?;
        info!(
            transfer = %detail.transfer.transfer_number,
            doc_num = created.doc_num,
            "Stock transfer posted to ERP"
        );
        Ok(created.doc_num.to_string())
    }
}
