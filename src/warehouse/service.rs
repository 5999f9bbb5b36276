//! Transfer lifecycle operations.
//!
//! Every mutation loads the current record, asks the workflow gate, and
//! only then writes. Transitions are applied in one database transaction
//! guarded on the status the gate saw, so a stale request fails with
//! `Conflict` instead of partially applying.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use stockflow_common::gate::{self, Subject};
use stockflow_common::{
    Actor, AddItemRequest, BinLocation, BulkSerialResult, CatalogItem, CreateTransferRequest,
    ListQuery, Page, RejectedSerial, SerialCheck, SerialNumber, StatusChange, Transfer,
    TransferAction, TransferDetail, TransferItem, TransferSummary, Warehouse,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::db::DbHandle;
use super::erp::Erp;
use super::ws::{TransferEvent, broadcast_event};
use crate::errors::TransferError;

#[derive(Clone)]
pub struct TransferService {
    db: DbHandle,
    erp: Arc<dyn Erp>,
    events: broadcast::Sender<String>,
}

/// Editability depends only on status and owner.
fn editability_subject(transfer: &Transfer) -> Subject {
    Subject {
        status: transfer.status,
        owner_id: transfer.owner_id,
        item_count: 0,
        unserialized_items: Vec::new(),
    }
}

static SERIAL_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,\s]+").unwrap());

fn required(field: &str, value: &str) -> Result<String, TransferError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TransferError::validation(field, "must not be blank"));
    }
    Ok(trimmed.to_string())
}

/// Split free-text serial input on commas and whitespace, dropping blanks
/// and repeats while keeping first-seen order.
pub fn split_serials(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in SERIAL_SEPARATORS.split(text) {
        let token = token.trim();
        if !token.is_empty() && !seen.iter().any(|s: &String| s == token) {
            seen.push(token.to_string());
        }
    }
    seen
}

impl TransferService {
    pub fn new(db: DbHandle, erp: Arc<dyn Erp>, events: broadcast::Sender<String>) -> Self {
        Self { db, erp, events }
    }

    pub fn events(&self) -> &broadcast::Sender<String> {
        &self.events
    }

    fn publish(&self, event: TransferEvent) {
        broadcast_event(&self.events, &event);
    }

    async fn load_transfer(&self, id: i64) -> Result<Transfer, TransferError> {
        self.db
            .call(move |db| {
                db.get_transfer(id)?
                    .ok_or_else(|| TransferError::not_found("Transfer", id))
            })
            .await
    }

    async fn load_item(&self, item_id: i64) -> Result<TransferItem, TransferError> {
        self.db
            .call(move |db| {
                db.get_item(item_id)?
                    .ok_or_else(|| TransferError::not_found("Item", item_id))
            })
            .await
    }

    async fn load_serial(&self, serial_id: i64) -> Result<SerialNumber, TransferError> {
        self.db
            .call(move |db| {
                db.get_serial(serial_id)?
                    .ok_or_else(|| TransferError::not_found("Serial", serial_id))
            })
            .await
    }

    /// Load the parent transfer of an item and check the actor may edit it.
    async fn editable_parent(
        &self,
        actor: &Actor,
        item: &TransferItem,
    ) -> Result<Transfer, TransferError> {
        let transfer = self.load_transfer(item.transfer_id).await?;
        gate::ensure_editable(&editability_subject(&transfer), actor)
            .map_err(|e| TransferError::from_gate(e, transfer.id))?;
        Ok(transfer)
    }

    // ── Transfers ─────────────────────────────────────────────────────

    pub async fn create(
        &self,
        actor: &Actor,
        req: CreateTransferRequest,
    ) -> Result<Transfer, TransferError> {
        let source = required("source", &req.source)?;
        let destination = required("destination", &req.destination)?;
        if source.eq_ignore_ascii_case(&destination) {
            return Err(TransferError::validation(
                "destination",
                "destination must differ from source",
            ));
        }
        let transfer_number = match req.transfer_number.as_deref() {
            Some(n) => Some(required("transfer_number", n)?),
            None => None,
        };
        let notes = req.notes.unwrap_or_default().trim().to_string();
        let priority = req.priority.unwrap_or_default();
        let owner_id = actor.user_id;

        let transfer = self
            .db
            .call(move |db| {
                db.create_transfer(
                    owner_id,
                    &source,
                    &destination,
                    &notes,
                    priority,
                    transfer_number.as_deref(),
                )
            })
            .await?;

        info!(
            transfer_id = transfer.id,
            transfer_number = %transfer.transfer_number,
            owner_id,
            "Transfer created"
        );
        self.publish(TransferEvent::TransferCreated {
            transfer: transfer.clone(),
        });
        Ok(transfer)
    }

    pub async fn get(&self, id: i64) -> Result<TransferDetail, TransferError> {
        self.db
            .call(move |db| {
                db.get_transfer_detail(id)?
                    .ok_or_else(|| TransferError::not_found("Transfer", id))
            })
            .await
    }

    pub async fn list(
        &self,
        actor: &Actor,
        query: ListQuery,
    ) -> Result<Page<TransferSummary>, TransferError> {
        query
            .validate()
            .map_err(|(field, message)| TransferError::validation(field, message))?;
        let actor_id = actor.user_id;
        self.db
            .call(move |db| Ok(db.list_transfers(&query, actor_id)?))
            .await
    }

    /// Delete a draft transfer together with its items and serials.
    pub async fn delete(&self, actor: &Actor, id: i64) -> Result<(), TransferError> {
        let transfer = self.load_transfer(id).await?;
        gate::ensure_editable(&editability_subject(&transfer), actor)
            .map_err(|e| TransferError::from_gate(e, id))?;

        let deleted = self
            .db
            .call(move |db| Ok(db.delete_draft_transfer(id)?))
            .await?;
        if !deleted {
            return Err(TransferError::Conflict(format!(
                "transfer {} is no longer a draft",
                id
            )));
        }
        info!(transfer_id = id, actor_id = actor.user_id, "Transfer deleted");
        self.publish(TransferEvent::TransferDeleted { transfer_id: id });
        Ok(())
    }

    /// Apply a workflow action. The gate decides; posting additionally
    /// requires the ERP to accept the stock transfer document first.
    pub async fn transition(
        &self,
        actor: &Actor,
        id: i64,
        action: TransferAction,
        reason: Option<String>,
    ) -> Result<Transfer, TransferError> {
        let detail = self.get(id).await?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let outcome = gate::evaluate(&Subject::from(&detail), actor, action, reason.as_deref())
            .map_err(|e| {
                warn!(
                    transfer_id = id,
                    action = %action,
                    status = %detail.transfer.status,
                    actor_id = actor.user_id,
                    error = %e,
                    "Transition refused"
                );
                TransferError::from_gate(e, id)
            })?;

        let erp_document = if action == TransferAction::Post {
            Some(self.erp.post_transfer(&detail).await.inspect_err(|e| {
                warn!(transfer_id = id, error = %e, "ERP posting failed; status unchanged");
            })?)
        } else {
            None
        };

        let actor_id = actor.user_id;
        let applied = outcome.clone();
        let transfer = self
            .db
            .call(move |db| {
                db.apply_transition(
                    id,
                    &applied,
                    actor_id,
                    reason.as_deref(),
                    erp_document.as_deref(),
                )
            })
            .await?;

        info!(
            transfer_id = id,
            from = %outcome.from,
            to = %outcome.to,
            action = %action,
            actor_id,
            "Transfer status changed"
        );
        self.publish(TransferEvent::StatusChanged {
            transfer: transfer.clone(),
            from: outcome.from,
            to: outcome.to,
            action,
            actor_id,
        });
        Ok(transfer)
    }

    pub async fn history(&self, id: i64) -> Result<Vec<StatusChange>, TransferError> {
        self.load_transfer(id).await?;
        self.db.call(move |db| Ok(db.history(id)?)).await
    }

    // ── Items ─────────────────────────────────────────────────────────

    pub async fn add_item(
        &self,
        actor: &Actor,
        transfer_id: i64,
        req: AddItemRequest,
    ) -> Result<TransferItem, TransferError> {
        let code = required("item_code", &req.item_code)?;
        if !(req.quantity.is_finite() && req.quantity > 0.0) {
            return Err(TransferError::validation(
                "quantity",
                "quantity must be greater than zero",
            ));
        }
        let batch = req
            .batch_number
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());

        let transfer = self.load_transfer(transfer_id).await?;
        gate::ensure_editable(&editability_subject(&transfer), actor)
            .map_err(|e| TransferError::from_gate(e, transfer_id))?;

        let catalog = self.erp.resolve_item(&code).await?;
        let quantity = req.quantity;
        let item = self
            .db
            .call(move |db| db.insert_item(transfer_id, &catalog, quantity, batch.as_deref()))
            .await?;

        info!(transfer_id, item_id = item.id, item_code = %item.item_code, "Item added");
        self.publish(TransferEvent::ItemAdded {
            transfer_id,
            item: item.clone(),
        });
        Ok(item)
    }

    pub async fn remove_item(&self, actor: &Actor, item_id: i64) -> Result<(), TransferError> {
        let item = self.load_item(item_id).await?;
        self.editable_parent(actor, &item).await?;

        let deleted = self
            .db
            .call(move |db| db.delete_item(item_id))
            .await?;
        if !deleted {
            return Err(TransferError::not_found("Item", item_id));
        }
        info!(transfer_id = item.transfer_id, item_id, "Item removed");
        self.publish(TransferEvent::ItemRemoved {
            transfer_id: item.transfer_id,
            item_id,
        });
        Ok(())
    }

    // ── Serials ───────────────────────────────────────────────────────

    pub async fn list_serials(&self, item_id: i64) -> Result<Vec<SerialNumber>, TransferError> {
        self.load_item(item_id).await?;
        self.db.call(move |db| Ok(db.list_serials(item_id)?)).await
    }

    /// Ask the ERP about a serial at the transfer's source location.
    async fn check_serial(
        &self,
        item: &TransferItem,
        transfer: &Transfer,
        serial: &str,
    ) -> Result<SerialCheck, TransferError> {
        let check = self
            .erp
            .validate_serial(&item.item_code, serial, &transfer.source)
            .await?;
        if !check.valid {
            let reason = check
                .message
                .unwrap_or_else(|| "rejected by the ERP".to_string());
            return Err(TransferError::InvalidSerial {
                serial: serial.to_string(),
                reason,
            });
        }
        Ok(check)
    }

    /// Checks shared by single and bulk serial entry.
    async fn serial_target(
        &self,
        actor: &Actor,
        item_id: i64,
    ) -> Result<(TransferItem, Transfer), TransferError> {
        let item = self.load_item(item_id).await?;
        let transfer = self.editable_parent(actor, &item).await?;
        if !item.serial_tracked {
            return Err(TransferError::validation(
                "serial",
                format!("item {} is not serial-tracked", item.item_code),
            ));
        }
        Ok((item, transfer))
    }

    async fn attach_serial(
        &self,
        item: &TransferItem,
        transfer: &Transfer,
        serial: &str,
    ) -> Result<SerialNumber, TransferError> {
        let serial = required("serial", serial)?;
        let item_id = item.id;

        // Advisory: saves an ERP round trip. The unique constraint decides.
        let existing = self
            .db
            .call(move |db| Ok(db.list_serials(item_id)?))
            .await?;
        if existing.iter().any(|s| s.serial == serial) {
            return Err(TransferError::DuplicateSerial { serial, item_id });
        }
        // serial count never exceeds the line quantity
        if existing.len() as f64 >= item.quantity {
            return Err(TransferError::validation(
                "serial",
                format!(
                    "item {} already has {} serial number(s) for quantity {}",
                    item.item_code,
                    existing.len(),
                    item.quantity
                ),
            ));
        }

        let check = self.check_serial(item, transfer, &serial).await?;
        let stored = self
            .db
            .call(move |db| db.insert_serial(item_id, &serial, check.system_number))
            .await?;

        info!(
            transfer_id = transfer.id,
            item_id,
            serial = %stored.serial,
            "Serial added"
        );
        self.publish(TransferEvent::SerialAdded {
            transfer_id: transfer.id,
            serial: stored.clone(),
        });
        Ok(stored)
    }

    pub async fn add_serial(
        &self,
        actor: &Actor,
        item_id: i64,
        serial: &str,
    ) -> Result<SerialNumber, TransferError> {
        let (item, transfer) = self.serial_target(actor, item_id).await?;
        self.attach_serial(&item, &transfer, serial).await
    }

    /// Add many serials from free text. Each one is validated on its own;
    /// failures are reported per serial rather than failing the batch.
    pub async fn add_serials_bulk(
        &self,
        actor: &Actor,
        item_id: i64,
        text: &str,
    ) -> Result<BulkSerialResult, TransferError> {
        let serials = split_serials(text);
        if serials.is_empty() {
            return Err(TransferError::validation(
                "serials",
                "no serial numbers given",
            ));
        }
        let (item, transfer) = self.serial_target(actor, item_id).await?;

        let mut result = BulkSerialResult::default();
        for serial in serials {
            match self.attach_serial(&item, &transfer, &serial).await {
                Ok(stored) => result.accepted.push(stored),
                Err(e) => result.rejected.push(RejectedSerial {
                    serial,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }
        Ok(result)
    }

    pub async fn edit_serial(
        &self,
        actor: &Actor,
        serial_id: i64,
        new_serial: &str,
    ) -> Result<SerialNumber, TransferError> {
        let new_serial = required("serial", new_serial)?;
        let current = self.load_serial(serial_id).await?;
        let item = self.load_item(current.item_id).await?;
        let transfer = self.editable_parent(actor, &item).await?;
        if current.serial == new_serial {
            return Ok(current);
        }

        let check = self.check_serial(&item, &transfer, &new_serial).await?;
        let updated = self
            .db
            .call(move |db| db.update_serial(serial_id, &new_serial, check.system_number))
            .await?;

        info!(
            transfer_id = transfer.id,
            serial_id,
            from = %current.serial,
            to = %updated.serial,
            "Serial edited"
        );
        self.publish(TransferEvent::SerialUpdated {
            transfer_id: transfer.id,
            serial: updated.clone(),
        });
        Ok(updated)
    }

    pub async fn remove_serial(&self, actor: &Actor, serial_id: i64) -> Result<(), TransferError> {
        let serial = self.load_serial(serial_id).await?;
        let item = self.load_item(serial.item_id).await?;
        let transfer = self.editable_parent(actor, &item).await?;

        let deleted = self
            .db
            .call(move |db| db.delete_serial(serial_id))
            .await?;
        if !deleted {
            return Err(TransferError::not_found("Serial", serial_id));
        }
        info!(transfer_id = transfer.id, serial_id, "Serial removed");
        self.publish(TransferEvent::SerialRemoved {
            transfer_id: transfer.id,
            item_id: item.id,
            serial_id,
        });
        Ok(())
    }

    // ── Lookups ───────────────────────────────────────────────────────

    pub async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError> {
        let code = required("item_code", code)?;
        self.erp.resolve_item(&code).await
    }

    pub async fn validate_serial(
        &self,
        item_code: &str,
        serial: &str,
        location: &str,
    ) -> Result<SerialCheck, TransferError> {
        let item_code = required("item_code", item_code)?;
        let serial = required("serial", serial)?;
        let location = required("location", location)?;
        self.erp.validate_serial(&item_code, &serial, &location).await
    }

    pub async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError> {
        self.erp.warehouses().await
    }

    pub async fn bins(&self, warehouse: &str) -> Result<Vec<BinLocation>, TransferError> {
        let warehouse = required("warehouse", warehouse)?;
        self.erp.bins(&warehouse).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::db::TransferDb;
    use crate::warehouse::erp::{CatalogSerial, InMemoryErp};
    use async_trait::async_trait;
    use stockflow_common::{ErrorKind, LineQcStatus, Precondition, Role, TransferStatus};

    const OWNER: i64 = 1;

    fn serial(s: &str, location: &str) -> CatalogSerial {
        CatalogSerial {
            serial: s.to_string(),
            item_code: "ITM-1".to_string(),
            location: location.to_string(),
            issued: false,
            system_number: Some(7),
        }
    }

    fn catalog() -> InMemoryErp {
        InMemoryErp::new()
            .with_item(CatalogItem {
                code: "ITM-1".into(),
                description: "Scanner".into(),
                serial_tracked: true,
                batch_tracked: false,
            })
            .with_item(CatalogItem {
                code: "ITM-2".into(),
                description: "Tape".into(),
                serial_tracked: false,
                batch_tracked: true,
            })
            .with_serial(serial("SN-100", "WH-A"))
            .with_serial(serial("SN-101", "WH-A"))
            .with_serial(serial("SN-102", "WH-A"))
            .with_serial(serial("SN-900", "WH-Z"))
    }

    fn service_with(erp: Arc<dyn Erp>) -> TransferService {
        let db = DbHandle::new(TransferDb::new_in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        TransferService::new(db, erp, tx)
    }

    fn service() -> TransferService {
        service_with(Arc::new(catalog()))
    }

    fn owner() -> Actor {
        Actor::new(OWNER, Role::User)
    }

    fn qc() -> Actor {
        Actor::new(50, Role::Qc)
    }

    fn manager() -> Actor {
        Actor::new(60, Role::Manager)
    }

    fn create_req(source: &str, destination: &str) -> CreateTransferRequest {
        CreateTransferRequest {
            source: source.into(),
            destination: destination.into(),
            notes: None,
            priority: None,
            transfer_number: None,
        }
    }

    fn item_req(code: &str, quantity: f64) -> AddItemRequest {
        AddItemRequest {
            item_code: code.into(),
            quantity,
            batch_number: None,
        }
    }

    #[tokio::test]
    async fn test_scenario_create_fill_submit_reject_reopen() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        assert_eq!(t.status, TransferStatus::Draft);
        assert_eq!(svc.get(t.id).await.unwrap().items_count(), 0);

        let item = svc.add_item(&owner(), t.id, item_req("ITM-1", 5.0)).await.unwrap();
        assert_eq!(item.item_description, "Scanner");
        assert_eq!(svc.get(t.id).await.unwrap().items_count(), 1);

        let err = svc
            .transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap_err();
        match err {
            TransferError::PreconditionFailed(Precondition::MissingSerials { item_codes }) => {
                assert_eq!(item_codes, vec!["ITM-1"]);
            }
            other => panic!("Expected missing serials, got {:?}", other),
        }

        svc.add_serial(&owner(), item.id, "SN-100").await.unwrap();
        let submitted = svc
            .transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();
        assert_eq!(submitted.status, TransferStatus::Submitted);

        let rejected = svc
            .transition(&qc(), t.id, TransferAction::QcReject, Some("wrong batch".into()))
            .await
            .unwrap();
        assert_eq!(rejected.status, TransferStatus::Rejected);
        assert_eq!(rejected.qc_notes.as_deref(), Some("wrong batch"));

        let reopened = svc
            .transition(&owner(), t.id, TransferAction::Reopen, None)
            .await
            .unwrap();
        assert_eq!(reopened.status, TransferStatus::Draft);
        assert!(reopened.qc_notes.is_none());

        let history = svc.history(t.id).await.unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn test_submit_without_items_then_with_item() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let err = svc
            .transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(err.field().as_deref(), Some("no_items"));

        svc.add_item(&owner(), t.id, item_req("ITM-2", 1.0)).await.unwrap();
        let t = svc
            .transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();
        assert_eq!(t.status, TransferStatus::Submitted);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let svc = service();
        let err = svc.create(&owner(), create_req("WH-A", "WH-A")).await.unwrap_err();
        assert_eq!(err.field().as_deref(), Some("destination"));
        let err = svc.create(&owner(), create_req("  ", "WH-A")).await.unwrap_err();
        assert_eq!(err.field().as_deref(), Some("source"));
        let err = svc.create(&owner(), create_req("wh-a", "WH-A")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_add_item_validation_and_lookup() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();

        let err = svc.add_item(&owner(), t.id, item_req("ITM-2", 0.0)).await.unwrap_err();
        assert_eq!(err.field().as_deref(), Some("quantity"));

        let err = svc.add_item(&owner(), t.id, item_req("NOPE", 1.0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        svc.add_item(&owner(), t.id, item_req("ITM-2", 1.0)).await.unwrap();
        let err = svc.add_item(&owner(), t.id, item_req("ITM-2", 2.0)).await.unwrap_err();
        assert_eq!(err.field().as_deref(), Some("item_code"));

        let stranger = Actor::new(999, Role::User);
        let err = svc.add_item(&stranger, t.id, item_req("ITM-1", 1.0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_mutations_outside_draft_are_not_editable() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let item = svc.add_item(&owner(), t.id, item_req("ITM-1", 2.0)).await.unwrap();
        let s = svc.add_serial(&owner(), item.id, "SN-100").await.unwrap();
        svc.transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();

        let errors = vec![
            svc.add_item(&owner(), t.id, item_req("ITM-2", 1.0)).await.unwrap_err(),
            svc.remove_item(&owner(), item.id).await.unwrap_err(),
            svc.add_serial(&owner(), item.id, "SN-101").await.unwrap_err(),
            svc.edit_serial(&owner(), s.id, "SN-101").await.unwrap_err(),
            svc.remove_serial(&owner(), s.id).await.unwrap_err(),
            svc.delete(&owner(), t.id).await.unwrap_err(),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::NotEditable, "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_serial_validation_outcomes() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let tracked = svc.add_item(&owner(), t.id, item_req("ITM-1", 3.0)).await.unwrap();
        let plain = svc.add_item(&owner(), t.id, item_req("ITM-2", 1.0)).await.unwrap();

        let err = svc.add_serial(&owner(), tracked.id, "SN-900").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSerial);

        let err = svc.add_serial(&owner(), tracked.id, "SN-404").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSerial);

        svc.add_serial(&owner(), tracked.id, "SN-100").await.unwrap();
        let err = svc.add_serial(&owner(), tracked.id, "SN-100").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateSerial);

        let err = svc.add_serial(&owner(), plain.id, "SN-101").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        // nothing invalid was stored
        let stored = svc.list_serials(tracked.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].system_number, Some(7));
    }

    #[tokio::test]
    async fn test_serial_count_capped_by_quantity() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let item = svc.add_item(&owner(), t.id, item_req("ITM-1", 1.0)).await.unwrap();
        svc.add_serial(&owner(), item.id, "SN-100").await.unwrap();
        let err = svc.add_serial(&owner(), item.id, "SN-101").await.unwrap_err();
        assert_eq!(err.field().as_deref(), Some("serial"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_same_serial_on_two_items_of_one_transfer() {
        let erp = InMemoryErp::new()
            .with_item(CatalogItem {
                code: "ITM-1".into(),
                description: "Scanner".into(),
                serial_tracked: true,
                batch_tracked: false,
            })
            .with_item(CatalogItem {
                code: "ITM-3".into(),
                description: "Scanner kit".into(),
                serial_tracked: true,
                batch_tracked: false,
            })
            .with_serial(serial("SN-100", "WH-A"));
        let svc = service_with(Arc::new(SerialFromAnyItem(erp)));
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let a = svc.add_item(&owner(), t.id, item_req("ITM-1", 1.0)).await.unwrap();
        let b = svc.add_item(&owner(), t.id, item_req("ITM-3", 1.0)).await.unwrap();
        svc.add_serial(&owner(), a.id, "SN-100").await.unwrap();
        svc.add_serial(&owner(), b.id, "SN-100").await.unwrap();
    }

    /// Accepts a known serial for any item code.
    struct SerialFromAnyItem(InMemoryErp);

    #[async_trait]
    impl Erp for SerialFromAnyItem {
        async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError> {
            self.0.resolve_item(code).await
        }
        async fn validate_serial(
            &self,
            _item_code: &str,
            serial: &str,
            location: &str,
        ) -> Result<SerialCheck, TransferError> {
            self.0.validate_serial("ITM-1", serial, location).await
        }
        async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError> {
            self.0.warehouses().await
        }
        async fn bins(&self, warehouse: &str) -> Result<Vec<BinLocation>, TransferError> {
            self.0.bins(warehouse).await
        }
        async fn post_transfer(&self, detail: &TransferDetail) -> Result<String, TransferError> {
            self.0.post_transfer(detail).await
        }
    }

    /// Holds every catalog lookup long enough for a submit to land first.
    struct SlowErp(InMemoryErp);

    const ERP_DELAY: std::time::Duration = std::time::Duration::from_millis(300);

    #[async_trait]
    impl Erp for SlowErp {
        async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError> {
            tokio::time::sleep(ERP_DELAY).await;
            self.0.resolve_item(code).await
        }
        async fn validate_serial(
            &self,
            item_code: &str,
            serial: &str,
            location: &str,
        ) -> Result<SerialCheck, TransferError> {
            tokio::time::sleep(ERP_DELAY).await;
            self.0.validate_serial(item_code, serial, location).await
        }
        async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError> {
            self.0.warehouses().await
        }
        async fn bins(&self, warehouse: &str) -> Result<Vec<BinLocation>, TransferError> {
            self.0.bins(warehouse).await
        }
        async fn post_transfer(&self, detail: &TransferDetail) -> Result<String, TransferError> {
            self.0.post_transfer(detail).await
        }
    }

    #[tokio::test]
    async fn test_item_add_racing_submit_is_refused() {
        let svc = service_with(Arc::new(SlowErp(catalog())));
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        svc.add_item(&owner(), t.id, item_req("ITM-2", 1.0)).await.unwrap();

        let transfer_id = t.id;
        let late = {
            let svc = svc.clone();
            tokio::spawn(
                async move { svc.add_item(&owner(), transfer_id, item_req("ITM-1", 1.0)).await },
            )
        };
        // let the add pass its editability check and wait on the ERP
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let submitted = svc
            .transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();
        assert_eq!(submitted.status, TransferStatus::Submitted);

        let err = late.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEditable);
        let detail = svc.get(t.id).await.unwrap();
        assert_eq!(detail.transfer.status, TransferStatus::Submitted);
        assert_eq!(detail.items_count(), 1);
        assert!(detail.items_missing_serials().is_empty());
    }

    #[tokio::test]
    async fn test_serial_add_racing_submit_is_refused() {
        let svc = service_with(Arc::new(SlowErp(catalog())));
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let item = svc.add_item(&owner(), t.id, item_req("ITM-1", 2.0)).await.unwrap();
        svc.add_serial(&owner(), item.id, "SN-100").await.unwrap();

        let item_id = item.id;
        let late = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.add_serial(&owner(), item_id, "SN-101").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        svc.transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();

        let err = late.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEditable);
        let serials = svc.list_serials(item.id).await.unwrap();
        assert_eq!(serials.len(), 1);
        assert_eq!(serials[0].serial, "SN-100");
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_serial_adds_store_one() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let item = svc.add_item(&owner(), t.id, item_req("ITM-1", 3.0)).await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.add_serial(&owner(), item.id, "SN-101").await })
            })
            .collect();
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::DuplicateSerial),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(svc.list_serials(item.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_serials_report_each_outcome() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let item = svc.add_item(&owner(), t.id, item_req("ITM-1", 5.0)).await.unwrap();

        let result = svc
            .add_serials_bulk(&owner(), item.id, "SN-100, SN-101\nSN-404 SN-100")
            .await
            .unwrap();
        let accepted: Vec<_> = result.accepted.iter().map(|s| s.serial.as_str()).collect();
        assert_eq!(accepted, vec!["SN-100", "SN-101"]);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].serial, "SN-404");
        assert_eq!(result.rejected[0].kind, ErrorKind::InvalidSerial);

        let err = svc.add_serials_bulk(&owner(), item.id, " , ").await.unwrap_err();
        assert_eq!(err.field().as_deref(), Some("serials"));
    }

    #[tokio::test]
    async fn test_edit_serial_revalidates() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        let item = svc.add_item(&owner(), t.id, item_req("ITM-1", 2.0)).await.unwrap();
        let s = svc.add_serial(&owner(), item.id, "SN-100").await.unwrap();

        let err = svc.edit_serial(&owner(), s.id, "SN-900").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSerial);
        let edited = svc.edit_serial(&owner(), s.id, "SN-102").await.unwrap();
        assert_eq!(edited.serial, "SN-102");
        assert_eq!(edited.id, s.id);
    }

    #[tokio::test]
    async fn test_approve_and_post_records_erp_document() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        svc.add_item(&owner(), t.id, item_req("ITM-2", 4.0)).await.unwrap();
        svc.transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();

        let err = svc
            .transition(&qc(), t.id, TransferAction::Post, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        let approved = svc
            .transition(&qc(), t.id, TransferAction::QcApprove, None)
            .await
            .unwrap();
        assert_eq!(approved.qc_reviewer_id, Some(qc().user_id));

        let err = svc
            .transition(&qc(), t.id, TransferAction::Post, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let posted = svc
            .transition(&manager(), t.id, TransferAction::Post, None)
            .await
            .unwrap();
        assert_eq!(posted.status, TransferStatus::Posted);
        assert_eq!(posted.erp_document_number.as_deref(), Some("ST-000001"));

        let detail = svc.get(t.id).await.unwrap();
        assert_eq!(detail.items[0].item.qc_status, LineQcStatus::Approved);
    }

    struct PostingDown(InMemoryErp);

    #[async_trait]
    impl Erp for PostingDown {
        async fn resolve_item(&self, code: &str) -> Result<CatalogItem, TransferError> {
            self.0.resolve_item(code).await
        }
        async fn validate_serial(
            &self,
            item_code: &str,
            serial: &str,
            location: &str,
        ) -> Result<SerialCheck, TransferError> {
            self.0.validate_serial(item_code, serial, location).await
        }
        async fn warehouses(&self) -> Result<Vec<Warehouse>, TransferError> {
            Err(TransferError::Unavailable("down".into()))
        }
        async fn bins(&self, _warehouse: &str) -> Result<Vec<BinLocation>, TransferError> {
            Err(TransferError::Unavailable("down".into()))
        }
        async fn post_transfer(&self, _detail: &TransferDetail) -> Result<String, TransferError> {
            Err(TransferError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_post_fails_atomically_when_erp_down() {
        let svc = service_with(Arc::new(PostingDown(catalog())));
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        svc.add_item(&owner(), t.id, item_req("ITM-2", 1.0)).await.unwrap();
        svc.transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();
        svc.transition(&qc(), t.id, TransferAction::QcApprove, None)
            .await
            .unwrap();

        let err = svc
            .transition(&manager(), t.id, TransferAction::Post, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        let after = svc.get(t.id).await.unwrap();
        assert_eq!(after.transfer.status, TransferStatus::QcApproved);
        assert!(after.transfer.erp_document_number.is_none());
        assert_eq!(after.history.len(), 3);
    }

    #[tokio::test]
    async fn test_reject_requires_reason_and_leaves_record() {
        let svc = service();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        svc.add_item(&owner(), t.id, item_req("ITM-2", 1.0)).await.unwrap();
        svc.transition(&owner(), t.id, TransferAction::Submit, None)
            .await
            .unwrap();

        let err = svc
            .transition(&qc(), t.id, TransferAction::QcReject, Some("   ".into()))
            .await
            .unwrap_err();
        assert_eq!(err.field().as_deref(), Some("missing_rejection_reason"));
        assert_eq!(
            svc.get(t.id).await.unwrap().transfer.status,
            TransferStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_delete_draft_and_events() {
        let svc = service();
        let mut rx = svc.events().subscribe();
        let t = svc.create(&owner(), create_req("WH-A", "WH-B")).await.unwrap();
        svc.delete(&owner(), t.id).await.unwrap();

        let first: TransferEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(first, TransferEvent::TransferCreated { .. }));
        let second: TransferEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second, TransferEvent::TransferDeleted { transfer_id: t.id });

        let err = svc.get(t.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_rejects_bad_page_size() {
        let svc = service();
        let err = svc
            .list(
                &owner(),
                ListQuery {
                    page_size: 7,
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.field().as_deref(), Some("page_size"));
    }

    #[test]
    fn test_split_serials() {
        assert_eq!(
            split_serials("A1, B2\r\nC3\tA1,,"),
            vec!["A1".to_string(), "B2".to_string(), "C3".to_string()]
        );
        assert!(split_serials(" \n ").is_empty());
    }
}
