//! List view coordinator.
//!
//! Owns the filter state and the last fetched page for a transfer list
//! view. Mutations go through the server and are followed by a re-fetch of
//! the current page, so item counts and statuses always come from the
//! server. Per-row affordances are recomputed from the shared gate every
//! time [`ListCoordinator::rows`] is called.

use chrono::{DateTime, Utc};
use stockflow_common::gate::{self, Subject};
use stockflow_common::{
    Actor, CreateTransferRequest, ErrorKind, GateError, ListQuery, PAGE_SIZES, Page, Pagination, Scope,
    Transfer, TransferAction, TransferSummary,
};
use tracing::{debug, warn};

use super::sync::{SyncError, SyncResult, TransferApi};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One rendered list row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    pub summary: TransferSummary,
    pub editable: bool,
    pub allowed_actions: Vec<TransferAction>,
}

pub struct ListCoordinator<A: TransferApi, C: Clock = SystemClock> {
    api: A,
    clock: C,
    actor: Actor,
    filters: ListQuery,
    page: Option<Page<TransferSummary>>,
    last_fetched_at: Option<DateTime<Utc>>,
    stale: bool,
}

impl<A: TransferApi> ListCoordinator<A, SystemClock> {
    pub fn new(api: A, actor: Actor) -> Self {
        Self::with_clock(api, SystemClock, actor)
    }
}

impl<A: TransferApi, C: Clock> ListCoordinator<A, C> {
    pub fn with_clock(api: A, clock: C, actor: Actor) -> Self {
        Self {
            api,
            clock,
            actor,
            filters: ListQuery::default(),
            page: None,
            last_fetched_at: None,
            stale: false,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn filters(&self) -> &ListQuery {
        &self.filters
    }

    pub fn pagination(&self) -> Option<&Pagination> {
        self.page.as_ref().map(|p| &p.pagination)
    }

    pub fn last_fetched_at(&self) -> Option<DateTime<Utc>> {
        self.last_fetched_at
    }

    /// True when a re-fetch after a mutation failed, so the held page may
    /// not reflect the server.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    // ── Filter state ──────────────────────────────────────────────────

    /// Takes effect on the next [`apply_filters`](Self::apply_filters).
    pub fn set_search(&mut self, search: impl Into<String>) {
        let search = search.into();
        self.filters.search = if search.trim().is_empty() {
            None
        } else {
            Some(search)
        };
    }

    pub fn set_scope(&mut self, scope: Scope) {
        self.filters.scope = scope;
    }

    pub fn set_page_size(&mut self, page_size: u32) -> SyncResult<()> {
        if !PAGE_SIZES.contains(&page_size) {
            return Err(SyncError::new(
                ErrorKind::Validation,
                format!("page size must be one of {:?}", PAGE_SIZES),
            )
            .with_field("page_size"));
        }
        self.filters.page_size = page_size;
        Ok(())
    }

    // ── Fetching ──────────────────────────────────────────────────────

    /// Re-fetch the current page with the current filters. On failure the
    /// previous page is kept.
    pub async fn refresh(&mut self) -> SyncResult<&Page<TransferSummary>> {
        let page = self.api.list(&self.filters).await?;
        Ok(self.store(page))
    }

    fn store(&mut self, page: Page<TransferSummary>) -> &Page<TransferSummary> {
        debug!(
            page = page.pagination.page,
            total = page.pagination.total_count,
            "Transfer list fetched"
        );
        self.last_fetched_at = Some(self.clock.now());
        self.stale = false;
        self.page.insert(page)
    }

    /// Back to page 1 with the current filters.
    pub async fn apply_filters(&mut self) -> SyncResult<&Page<TransferSummary>> {
        self.filters.page = 1;
        self.refresh().await
    }

    pub async fn change_page(&mut self, page: u32) -> SyncResult<&Page<TransferSummary>> {
        if page < 1 {
            return Err(
                SyncError::new(ErrorKind::Validation, "page must be 1 or greater")
                    .with_field("page"),
            );
        }
        let previous = self.filters.page;
        self.filters.page = page;
        match self.api.list(&self.filters).await {
            Ok(fetched) => Ok(self.store(fetched)),
            Err(e) => {
                self.filters.page = previous;
                Err(e)
            }
        }
    }

    /// Reset every filter to its default and re-fetch.
    pub async fn clear(&mut self) -> SyncResult<&Page<TransferSummary>> {
        self.filters = ListQuery::default();
        self.refresh().await
    }

    /// Rows of the held page with editability and actions for the actor.
    pub fn rows(&self) -> Vec<RowView> {
        let Some(page) = &self.page else {
            return Vec::new();
        };
        page.records
            .iter()
            .map(|summary| {
                let subject = Subject::from(summary);
                RowView {
                    editable: gate::is_editable(&subject, &self.actor),
                    allowed_actions: gate::allowed_actions(&subject, &self.actor),
                    summary: summary.clone(),
                }
            })
            .collect()
    }

    fn held(&self, id: i64) -> Option<&TransferSummary> {
        self.page
            .as_ref()
            .and_then(|p| p.records.iter().find(|s| s.transfer.id == id))
    }

    // ── Mutations ─────────────────────────────────────────────────────

    async fn refetch_after_mutation(&mut self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Re-fetch after mutation failed; list may be stale");
            self.stale = true;
        }
    }

    pub async fn create(&mut self, req: &CreateTransferRequest) -> SyncResult<Transfer> {
        let transfer = self.api.create(req).await?;
        self.refetch_after_mutation().await;
        Ok(transfer)
    }

    /// Consult the gate against the held row before a mutation. A refusal
    /// is only final once it holds against a freshly fetched row, since the
    /// held page may predate a change made by another client. Rows that are
    /// not on the page are left to the server.
    async fn precheck<F>(&mut self, id: i64, check: F) -> SyncResult<()>
    where
        F: Fn(&Subject, &Actor) -> Result<(), GateError>,
    {
        let Some(summary) = self.held(id) else {
            return Ok(());
        };
        if check(&Subject::from(summary), &self.actor).is_ok() {
            return Ok(());
        }

        debug!(id, "Held row refused locally, re-fetching before deciding");
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Re-fetch before mutation failed; deferring to server");
            self.stale = true;
            return Ok(());
        }
        match self.held(id) {
            Some(fresh) => Ok(check(&Subject::from(fresh), &self.actor)?),
            None => Ok(()),
        }
    }

    /// Request a workflow action. The gate is consulted first (see
    /// [`Self::precheck`]) and a confirmed refusal never reaches the server.
    /// A server refusal caused by stale state also triggers a re-fetch.
    pub async fn transition(
        &mut self,
        id: i64,
        action: TransferAction,
        reason: Option<&str>,
    ) -> SyncResult<Transfer> {
        self.precheck(id, |subject, actor| {
            gate::evaluate(subject, actor, action, reason).map(|_| ())
        })
        .await?;
        match self.api.transition(id, action, reason).await {
            Ok(transfer) => {
                self.refetch_after_mutation().await;
                Ok(transfer)
            }
            Err(e) => {
                if matches!(
                    e.kind,
                    ErrorKind::Conflict
                        | ErrorKind::PreconditionFailed
                        | ErrorKind::InvalidTransition
                        | ErrorKind::NotFound
                ) {
                    self.refetch_after_mutation().await;
                }
                Err(e)
            }
        }
    }

    pub async fn delete(&mut self, id: i64) -> SyncResult<()> {
        self.precheck(id, gate::ensure_editable).await?;
        self.api.delete(id).await?;
        self.refetch_after_mutation().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use stockflow_common::{
        AddItemRequest, BulkSerialResult, CatalogItem, Priority, Role, SerialCheck, SerialNumber,
        StatusChange, TransferDetail, TransferItem, TransferStatus,
    };

    const OWNER: i64 = 1;

    #[derive(Default)]
    struct FakeState {
        transfers: Vec<TransferSummary>,
        list_calls: Vec<ListQuery>,
        transition_calls: Vec<(i64, TransferAction)>,
        fail_list: bool,
        fail_transition: Option<ErrorKind>,
    }

    #[derive(Clone, Default)]
    struct FakeApi {
        state: Arc<Mutex<FakeState>>,
    }

    fn summary(id: i64, status: TransferStatus, owner_id: i64, items: i64) -> TransferSummary {
        TransferSummary {
            transfer: Transfer {
                id,
                transfer_number: format!("TR-{:05}", id),
                source: "WH-A".into(),
                destination: "WH-B".into(),
                status,
                priority: Priority::Normal,
                notes: String::new(),
                owner_id,
                qc_notes: None,
                qc_reviewer_id: None,
                qc_reviewed_at: None,
                erp_document_number: None,
                created_at: "2026-01-01 00:00:00".into(),
                updated_at: "2026-01-01 00:00:00".into(),
            },
            items_count: items,
            items_missing_serials: vec![],
        }
    }

    impl FakeApi {
        fn with(transfers: Vec<TransferSummary>) -> Self {
            let api = Self::default();
            api.state.lock().unwrap().transfers = transfers;
            api
        }

        fn unsupported<T>() -> SyncResult<T> {
            Err(SyncError::new(ErrorKind::Unknown, "not used by these tests"))
        }
    }

    #[async_trait]
    impl TransferApi for FakeApi {
        async fn me(&self) -> SyncResult<Actor> {
            Ok(Actor::new(OWNER, Role::User))
        }

        async fn list(&self, query: &ListQuery) -> SyncResult<Page<TransferSummary>> {
            let mut state = self.state.lock().unwrap();
            state.list_calls.push(query.clone());
            if state.fail_list {
                return Err(SyncError::new(ErrorKind::Unavailable, "connection refused"));
            }
            let matching: Vec<_> = state
                .transfers
                .iter()
                .filter(|s| query.scope == Scope::All || s.transfer.owner_id == OWNER)
                .filter(|s| match query.search_term() {
                    Some(term) => s.transfer.transfer_number.contains(term),
                    None => true,
                })
                .cloned()
                .collect();
            let total = matching.len() as u64;
            let records = matching
                .into_iter()
                .skip(query.offset() as usize)
                .take(query.page_size as usize)
                .collect();
            Ok(Page {
                records,
                pagination: Pagination::new(query.page, query.page_size, total),
            })
        }

        async fn get(&self, _id: i64) -> SyncResult<TransferDetail> {
            Self::unsupported()
        }

        async fn create(&self, req: &CreateTransferRequest) -> SyncResult<Transfer> {
            let mut state = self.state.lock().unwrap();
            let id = state.transfers.len() as i64 + 1;
            let mut created = summary(id, TransferStatus::Draft, OWNER, 0);
            created.transfer.source = req.source.clone();
            created.transfer.destination = req.destination.clone();
            state.transfers.push(created.clone());
            Ok(created.transfer)
        }

        async fn delete(&self, id: i64) -> SyncResult<()> {
            self.state
                .lock()
                .unwrap()
                .transfers
                .retain(|s| s.transfer.id != id);
            Ok(())
        }

        async fn history(&self, _id: i64) -> SyncResult<Vec<StatusChange>> {
            Self::unsupported()
        }

        async fn transition(
            &self,
            id: i64,
            action: TransferAction,
            _reason: Option<&str>,
        ) -> SyncResult<Transfer> {
            let mut state = self.state.lock().unwrap();
            state.transition_calls.push((id, action));
            if let Some(kind) = state.fail_transition {
                return Err(SyncError::new(kind, "server refused"));
            }
            let row = state
                .transfers
                .iter_mut()
                .find(|s| s.transfer.id == id)
                .ok_or_else(|| SyncError::new(ErrorKind::NotFound, "missing"))?;
            let to = stockflow_common::status::transition_target(row.transfer.status, action)
                .ok_or_else(|| SyncError::new(ErrorKind::InvalidTransition, "bad"))?;
            row.transfer.status = to;
            Ok(row.transfer.clone())
        }

        async fn add_item(&self, _t: i64, _r: &AddItemRequest) -> SyncResult<TransferItem> {
            Self::unsupported()
        }
        async fn remove_item(&self, _id: i64) -> SyncResult<()> {
            Self::unsupported()
        }
        async fn list_serials(&self, _id: i64) -> SyncResult<Vec<SerialNumber>> {
            Self::unsupported()
        }
        async fn add_serial(&self, _id: i64, _s: &str) -> SyncResult<SerialNumber> {
            Self::unsupported()
        }
        async fn add_serials_bulk(&self, _id: i64, _t: &str) -> SyncResult<BulkSerialResult> {
            Self::unsupported()
        }
        async fn edit_serial(&self, _id: i64, _s: &str) -> SyncResult<SerialNumber> {
            Self::unsupported()
        }
        async fn remove_serial(&self, _id: i64) -> SyncResult<()> {
            Self::unsupported()
        }
        async fn resolve_item(&self, _code: &str) -> SyncResult<CatalogItem> {
            Self::unsupported()
        }
        async fn validate_serial(&self, _i: &str, _s: &str, _l: &str) -> SyncResult<SerialCheck> {
            Self::unsupported()
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn clock() -> FixedClock {
        FixedClock(
            DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    fn coordinator(api: FakeApi, actor: Actor) -> ListCoordinator<FakeApi, FixedClock> {
        ListCoordinator::with_clock(api, clock(), actor)
    }

    fn owner() -> Actor {
        Actor::new(OWNER, Role::User)
    }

    fn many(n: i64) -> Vec<TransferSummary> {
        (1..=n)
            .map(|id| summary(id, TransferStatus::Draft, OWNER, 1))
            .collect()
    }

    #[tokio::test]
    async fn test_refresh_records_page_and_time() {
        let mut c = coordinator(FakeApi::with(many(3)), owner());
        assert!(c.last_fetched_at().is_none());
        let page = c.refresh().await.unwrap();
        assert_eq!(page.records.len(), 3);
        assert_eq!(c.pagination().unwrap().total_pages, 1);
        assert_eq!(c.last_fetched_at(), Some(clock().0));
    }

    #[tokio::test]
    async fn test_apply_filters_resets_to_first_page() {
        let api = FakeApi::with(many(25));
        let mut c = coordinator(api.clone(), owner());
        c.change_page(3).await.unwrap();
        assert_eq!(c.filters().page, 3);
        assert_eq!(c.rows().len(), 5);

        c.set_search("TR-0001");
        let page = c.apply_filters().await.unwrap();
        assert_eq!(page.pagination.page, 1);
        assert_eq!(page.pagination.total_count, 10);
        let last = api.state.lock().unwrap().list_calls.last().cloned().unwrap();
        assert_eq!(last.page, 1);
        assert_eq!(last.search.as_deref(), Some("TR-0001"));
    }

    #[tokio::test]
    async fn test_clear_restores_defaults() {
        let api = FakeApi::with(many(2));
        let mut c = coordinator(api.clone(), owner());
        c.set_search("x");
        c.set_scope(Scope::All);
        c.set_page_size(50).unwrap();
        c.change_page(2).await.unwrap();

        c.clear().await.unwrap();
        assert_eq!(c.filters(), &ListQuery::default());
        let last = api.state.lock().unwrap().list_calls.last().cloned().unwrap();
        assert_eq!(last, ListQuery::default());
    }

    #[tokio::test]
    async fn test_invalid_page_and_size_rejected_locally() {
        let api = FakeApi::with(many(1));
        let mut c = coordinator(api.clone(), owner());
        let err = c.set_page_size(7).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("page_size"));
        let err = c.change_page(0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(api.state.lock().unwrap().list_calls.is_empty());
    }

    #[tokio::test]
    async fn test_failed_page_change_keeps_previous_state() {
        let api = FakeApi::with(many(30));
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();
        api.state.lock().unwrap().fail_list = true;

        let err = c.change_page(2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(c.filters().page, 1);
        assert_eq!(c.pagination().unwrap().page, 1);
    }

    #[tokio::test]
    async fn test_rows_carry_gate_affordances() {
        let api = FakeApi::with(vec![
            summary(1, TransferStatus::Draft, OWNER, 1),
            summary(2, TransferStatus::Draft, 99, 1),
            summary(3, TransferStatus::Submitted, OWNER, 1),
            summary(4, TransferStatus::Rejected, OWNER, 1),
        ]);
        let mut c = coordinator(api, owner());
        c.set_scope(Scope::All);
        c.apply_filters().await.unwrap();

        let rows = c.rows();
        assert!(rows[0].editable);
        assert_eq!(rows[0].allowed_actions, vec![TransferAction::Submit]);
        assert!(!rows[1].editable);
        assert!(rows[1].allowed_actions.is_empty());
        assert!(!rows[2].editable);
        assert!(rows[2].allowed_actions.is_empty());
        assert_eq!(rows[3].allowed_actions, vec![TransferAction::Reopen]);
    }

    #[tokio::test]
    async fn test_create_refetches_instead_of_patching() {
        let api = FakeApi::with(many(1));
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();
        let calls_before = api.state.lock().unwrap().list_calls.len();

        let created = c
            .create(&CreateTransferRequest {
                source: "WH-A".into(),
                destination: "WH-C".into(),
                notes: None,
                priority: None,
                transfer_number: None,
            })
            .await
            .unwrap();
        assert_eq!(created.status, TransferStatus::Draft);
        assert_eq!(api.state.lock().unwrap().list_calls.len(), calls_before + 1);
        assert_eq!(c.pagination().unwrap().total_count, 2);
        assert!(!c.is_stale());
    }

    #[tokio::test]
    async fn test_transition_prechecked_with_gate() {
        let api = FakeApi::with(vec![summary(1, TransferStatus::Draft, OWNER, 0)]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();

        let err = c
            .transition(1, TransferAction::Submit, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);
        assert_eq!(err.field.as_deref(), Some("no_items"));
        {
            let state = api.state.lock().unwrap();
            assert!(state.transition_calls.is_empty());
            // the refusal was confirmed against a fresh page
            assert_eq!(state.list_calls.len(), 2);
        }

        let err = c
            .transition(1, TransferAction::Post, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_transition_success_refetches_status() {
        let api = FakeApi::with(vec![summary(1, TransferStatus::Draft, OWNER, 2)]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();

        let t = c.transition(1, TransferAction::Submit, None).await.unwrap();
        assert_eq!(t.status, TransferStatus::Submitted);
        let rows = c.rows();
        assert_eq!(rows[0].summary.transfer.status, TransferStatus::Submitted);
        assert!(!rows[0].editable);
    }

    #[tokio::test]
    async fn test_stale_server_refusal_forces_refetch() {
        let api = FakeApi::with(vec![summary(1, TransferStatus::Draft, OWNER, 2)]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();
        api.state.lock().unwrap().fail_transition = Some(ErrorKind::Conflict);
        let calls_before = api.state.lock().unwrap().list_calls.len();

        let err = c.transition(1, TransferAction::Submit, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(api.state.lock().unwrap().list_calls.len(), calls_before + 1);
    }

    #[tokio::test]
    async fn test_refetch_failure_marks_stale() {
        let api = FakeApi::with(vec![summary(1, TransferStatus::Draft, OWNER, 2)]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();
        api.state.lock().unwrap().fail_list = true;

        c.transition(1, TransferAction::Submit, None).await.unwrap();
        assert!(c.is_stale());
        // held page is unchanged until a refresh succeeds
        assert_eq!(c.rows()[0].summary.transfer.status, TransferStatus::Draft);
    }

    #[tokio::test]
    async fn test_delete_requires_editability() {
        let api = FakeApi::with(vec![
            summary(1, TransferStatus::Submitted, OWNER, 1),
            summary(2, TransferStatus::Draft, OWNER, 1),
        ]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();

        let err = c.delete(1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotEditable);

        c.delete(2).await.unwrap();
        assert_eq!(c.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_local_refusal_rechecked_against_fresh_row() {
        let api = FakeApi::with(vec![summary(1, TransferStatus::Rejected, OWNER, 0)]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();

        // another client reopened the transfer and added a line
        {
            let mut state = api.state.lock().unwrap();
            let row = &mut state.transfers[0];
            row.transfer.status = TransferStatus::Draft;
            row.items_count = 1;
        }

        let t = c.transition(1, TransferAction::Submit, None).await.unwrap();
        assert_eq!(t.status, TransferStatus::Submitted);
        let state = api.state.lock().unwrap();
        assert_eq!(state.transition_calls, vec![(1, TransferAction::Submit)]);
        // initial fetch, re-check fetch, post-mutation fetch
        assert_eq!(state.list_calls.len(), 3);
    }

    #[tokio::test]
    async fn test_refusal_defers_to_server_when_refetch_fails() {
        let api = FakeApi::with(vec![summary(1, TransferStatus::Rejected, OWNER, 1)]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();
        {
            let mut state = api.state.lock().unwrap();
            state.transfers[0].transfer.status = TransferStatus::Draft;
            state.fail_list = true;
        }

        c.transition(1, TransferAction::Submit, None).await.unwrap();
        assert!(c.is_stale());
        assert_eq!(api.state.lock().unwrap().transition_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_rechecks_stale_read_only_row() {
        let api = FakeApi::with(vec![summary(1, TransferStatus::Submitted, OWNER, 1)]);
        let mut c = coordinator(api.clone(), owner());
        c.refresh().await.unwrap();
        api.state.lock().unwrap().transfers[0].transfer.status = TransferStatus::Draft;

        c.delete(1).await.unwrap();
        assert!(c.rows().is_empty());
    }
}
