//! Sync client: typed access to the transfer server over HTTP.
//!
//! Every failure, whether the server refused the request, the network
//! dropped it, or the response could not be decoded, comes back as a
//! [`SyncError`] carrying one [`ErrorKind`]. Callers handle one vocabulary
//! regardless of where the failure started.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stockflow_common::{
    Actor, AddItemRequest, BulkSerialRequest, BulkSerialResult, CatalogItem,
    CreateTransferRequest, ErrorBody, ErrorKind, GateError, ListQuery, Page, SerialCheck,
    Role, SerialNumber, SerialRequest, StatusChange, Transfer, TransferAction, TransferDetail,
    TransferItem, TransferSummary, TransitionRequest,
};
use thiserror::Error;
use tracing::debug;

use crate::config::ClientSection;
use crate::warehouse::api::{ROLE_HEADER, USER_HEADER};

/// Longest slice of a non-JSON error body kept as the message.
const MAX_MESSAGE_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
    /// Field or precondition code the failure is about, when known.
    pub field: Option<String>,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Build the error for a non-success response. A structured error body
    /// is trusted; anything else is classified by status code.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
            return Self {
                kind: parsed.kind,
                message: parsed.error,
                field: parsed.field,
            };
        }
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        let message = if text.is_empty() {
            match StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
            {
                Some(reason) => format!("HTTP {} {}", status, reason),
                None => format!("HTTP {}", status),
            }
        } else {
            text.chars().take(MAX_MESSAGE_LEN).collect()
        };
        Self::new(kind_for_status(status), message)
    }

    /// Classify a failure that happened before a response was read.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_decode() || err.is_builder() {
            ErrorKind::Unknown
        } else {
            ErrorKind::Unavailable
        };
        Self::new(kind, err.to_string())
    }
}

impl From<GateError> for SyncError {
    fn from(err: GateError) -> Self {
        let field = match &err {
            GateError::PreconditionFailed(p) => Some(p.code().to_string()),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            field,
        }
    }
}

/// Status-code fallback used when the body carries no `kind`.
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        400 | 422 => ErrorKind::Validation,
        401 | 403 => ErrorKind::Unauthorized,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        412 => ErrorKind::PreconditionFailed,
        502..=504 => ErrorKind::Unavailable,
        _ => ErrorKind::Unknown,
    }
}

/// Operations the transfer server offers. Implemented over HTTP by
/// [`SyncClient`]; the list coordinator depends only on this trait.
#[async_trait]
pub trait TransferApi: Send + Sync {
    async fn me(&self) -> SyncResult<Actor>;
    async fn list(&self, query: &ListQuery) -> SyncResult<Page<TransferSummary>>;
    async fn get(&self, id: i64) -> SyncResult<TransferDetail>;
    async fn create(&self, req: &CreateTransferRequest) -> SyncResult<Transfer>;
    async fn delete(&self, id: i64) -> SyncResult<()>;
    async fn history(&self, id: i64) -> SyncResult<Vec<StatusChange>>;

    /// Request a workflow action. `reason` is sent only for `qc_reject`.
    async fn transition(
        &self,
        id: i64,
        action: TransferAction,
        reason: Option<&str>,
    ) -> SyncResult<Transfer>;

    async fn add_item(&self, transfer_id: i64, req: &AddItemRequest) -> SyncResult<TransferItem>;
    async fn remove_item(&self, item_id: i64) -> SyncResult<()>;
    async fn list_serials(&self, item_id: i64) -> SyncResult<Vec<SerialNumber>>;
    async fn add_serial(&self, item_id: i64, serial: &str) -> SyncResult<SerialNumber>;
    async fn add_serials_bulk(&self, item_id: i64, text: &str) -> SyncResult<BulkSerialResult>;
    async fn edit_serial(&self, serial_id: i64, serial: &str) -> SyncResult<SerialNumber>;
    async fn remove_serial(&self, serial_id: i64) -> SyncResult<()>;
    async fn resolve_item(&self, code: &str) -> SyncResult<CatalogItem>;
    async fn validate_serial(
        &self,
        item_code: &str,
        serial: &str,
        location: &str,
    ) -> SyncResult<SerialCheck>;

    async fn submit(&self, id: i64) -> SyncResult<Transfer> {
        self.transition(id, TransferAction::Submit, None).await
    }

    async fn qc_approve(&self, id: i64) -> SyncResult<Transfer> {
        self.transition(id, TransferAction::QcApprove, None).await
    }

    async fn qc_reject(&self, id: i64, reason: &str) -> SyncResult<Transfer> {
        self.transition(id, TransferAction::QcReject, Some(reason))
            .await
    }

    async fn post(&self, id: i64) -> SyncResult<Transfer> {
        self.transition(id, TransferAction::Post, None).await
    }

    async fn reopen(&self, id: i64) -> SyncResult<Transfer> {
        self.transition(id, TransferAction::Reopen, None).await
    }
}

/// HTTP implementation of [`TransferApi`].
pub struct SyncClient {
    http: reqwest::Client,
    base_url: Url,
    actor: Option<Actor>,
}

impl SyncClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid server URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Server URL '{}' cannot be used as a base", base_url);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            actor: None,
        })
    }

    /// Client for the `[client]` config section, acting as the configured
    /// user when one is set.
    pub fn from_config(section: &ClientSection, timeout: Duration) -> anyhow::Result<Self> {
        let client = Self::new(&section.base_url, timeout)?;
        Ok(match section.user_id {
            Some(user_id) => client.with_actor(Actor::new(
                user_id,
                section.role.unwrap_or(Role::User),
            )),
            None => client,
        })
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn actor(&self) -> Option<Actor> {
        self.actor
    }

    fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::new(ErrorKind::Unknown, "server URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match self.actor {
            Some(actor) => builder
                .header(USER_HEADER, actor.user_id.to_string())
                .header(ROLE_HEADER, actor.role.as_str()),
            None => builder,
        }
    }

    /// Send and return the raw success body.
    async fn execute(&self, builder: reqwest::RequestBuilder) -> SyncResult<Vec<u8>> {
        let resp = builder
            .send()
            .await
            .map_err(|e| SyncError::from_transport(&e))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| SyncError::from_transport(&e))?
            .to_vec();
        debug!(status = status.as_u16(), len = body.len(), "Server response");
        if status.is_success() {
            Ok(body)
        } else {
            Err(SyncError::from_response(status.as_u16(), &body))
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> SyncResult<T> {
        let body = self.execute(builder).await?;
        serde_json::from_slice(&body).map_err(|e| {
            SyncError::new(
                ErrorKind::Unknown,
                format!("Malformed response from server: {}", e),
            )
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> SyncResult<T> {
        let url = self.url(segments)?;
        self.fetch(self.request(Method::GET, url)).await
    }

    async fn send_json<B: Serialize + ?Sized + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> SyncResult<T> {
        let url = self.url(segments)?;
        self.fetch(self.request(method, url).json(body)).await
    }

    async fn delete_path(&self, segments: &[&str]) -> SyncResult<()> {
        let url = self.url(segments)?;
        self.execute(self.request(Method::DELETE, url))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl TransferApi for SyncClient {
    async fn me(&self) -> SyncResult<Actor> {
        self.get_json(&["api", "me"]).await
    }

    async fn list(&self, query: &ListQuery) -> SyncResult<Page<TransferSummary>> {
        let url = self.url(&["api", "transfers"])?;
        self.fetch(self.request(Method::GET, url).query(query)).await
    }

    async fn get(&self, id: i64) -> SyncResult<TransferDetail> {
        self.get_json(&["api", "transfers", &id.to_string()]).await
    }

    async fn create(&self, req: &CreateTransferRequest) -> SyncResult<Transfer> {
        self.send_json(Method::POST, &["api", "transfers"], req)
            .await
    }

    async fn delete(&self, id: i64) -> SyncResult<()> {
        self.delete_path(&["api", "transfers", &id.to_string()])
            .await
    }

    async fn history(&self, id: i64) -> SyncResult<Vec<StatusChange>> {
        self.get_json(&["api", "transfers", &id.to_string(), "history"])
            .await
    }

    async fn transition(
        &self,
        id: i64,
        action: TransferAction,
        reason: Option<&str>,
    ) -> SyncResult<Transfer> {
        let body = TransitionRequest {
            reason: reason.map(str::to_string),
        };
        debug!(transfer_id = id, action = %action, "Requesting transition");
        self.send_json(
            Method::POST,
            &["api", "transfers", &id.to_string(), action.as_str()],
            &body,
        )
        .await
    }

    async fn add_item(&self, transfer_id: i64, req: &AddItemRequest) -> SyncResult<TransferItem> {
        self.send_json(
            Method::POST,
            &["api", "transfers", &transfer_id.to_string(), "items"],
            req,
        )
        .await
    }

    async fn remove_item(&self, item_id: i64) -> SyncResult<()> {
        self.delete_path(&["api", "items", &item_id.to_string()])
            .await
    }

    async fn list_serials(&self, item_id: i64) -> SyncResult<Vec<SerialNumber>> {
        self.get_json(&["api", "items", &item_id.to_string(), "serials"])
            .await
    }

    async fn add_serial(&self, item_id: i64, serial: &str) -> SyncResult<SerialNumber> {
        let body = SerialRequest {
            serial: serial.to_string(),
        };
        self.send_json(
            Method::POST,
            &["api", "items", &item_id.to_string(), "serials"],
            &body,
        )
        .await
    }

    async fn add_serials_bulk(&self, item_id: i64, text: &str) -> SyncResult<BulkSerialResult> {
        let body = BulkSerialRequest {
            serials: text.to_string(),
        };
        self.send_json(
            Method::POST,
            &["api", "items", &item_id.to_string(), "serials", "bulk"],
            &body,
        )
        .await
    }

    async fn edit_serial(&self, serial_id: i64, serial: &str) -> SyncResult<SerialNumber> {
        let body = SerialRequest {
            serial: serial.to_string(),
        };
        self.send_json(
            Method::PUT,
            &["api", "serials", &serial_id.to_string()],
            &body,
        )
        .await
    }

    async fn remove_serial(&self, serial_id: i64) -> SyncResult<()> {
        self.delete_path(&["api", "serials", &serial_id.to_string()])
            .await
    }

    async fn resolve_item(&self, code: &str) -> SyncResult<CatalogItem> {
        self.get_json(&["api", "catalog", "items", code]).await
    }

    async fn validate_serial(
        &self,
        item_code: &str,
        serial: &str,
        location: &str,
    ) -> SyncResult<SerialCheck> {
        let url = self.url(&["api", "catalog", "serials", "validate"])?;
        let query = [
            ("item_code", item_code),
            ("serial", serial),
            ("location", location),
        ];
        self.fetch(self.request(Method::GET, url).query(&query))
            .await
    }
}
