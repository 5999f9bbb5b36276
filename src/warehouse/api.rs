use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts, Path, Query, Request, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use stockflow_common::{
    Actor, AddItemRequest, BulkSerialRequest, CreateTransferRequest, ErrorBody, ErrorKind,
    ListQuery, Role, SerialRequest, TransferAction, TransitionRequest,
};
use tokio::sync::broadcast;

use super::service::TransferService;
use super::ws::ws_handler;
use crate::errors::TransferError;

/// Header carrying the acting user's id.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the acting user's role. Absent means `user`.
pub const ROLE_HEADER: &str = "x-user-role";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: TransferService,
    pub events: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(service: TransferService) -> Self {
        let events = service.events().clone();
        Self { service, events }
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Deserialize)]
pub struct SerialLookupParams {
    pub item_code: String,
    pub serial: String,
    pub location: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Transfer(TransferError),
    /// No usable actor identity on the request.
    MissingActor(String),
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        ApiError::Transfer(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotEditable
        | ErrorKind::InvalidTransition
        | ErrorKind::DuplicateSerial
        | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::PreconditionFailed | ErrorKind::InvalidSerial => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Transfer(err) => {
                let kind = err.kind();
                if kind == ErrorKind::Unknown {
                    tracing::error!(error = ?err, "Request failed");
                }
                let body = ErrorBody {
                    error: err.to_string(),
                    kind,
                    field: err.field(),
                };
                (status_for(kind), body)
            }
            ApiError::MissingActor(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: msg,
                    kind: ErrorKind::Unauthorized,
                    field: Some(USER_HEADER.to_string()),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ── Extractors ────────────────────────────────────────────────────────

/// The acting user, read from the identity headers set by the gateway.
pub struct CurrentActor(pub Actor);

pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::MissingActor(format!("missing {} header", USER_HEADER)))?
        .trim()
        .parse::<i64>()
        .map_err(|_| ApiError::MissingActor(format!("invalid {} header", USER_HEADER)))?;

    let role = match headers.get(ROLE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => Role::from_str(raw.trim()).map_err(ApiError::MissingActor)?,
        None => Role::User,
    };
    Ok(Actor::new(user_id, role))
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentActor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers).map(CurrentActor)
    }
}

/// `Json` whose rejection uses the API error body.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(TransferError::validation("body", rejection.body_text()).into()),
        }
    }
}

/// `Query` whose rejection uses the API error body.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(rejection) => Err(TransferError::validation("query", rejection.body_text()).into()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/api/me", get(current_user))
        .route("/api/transfers", get(list_transfers).post(create_transfer))
        .route(
            "/api/transfers/{id}",
            get(get_transfer).delete(delete_transfer),
        )
        .route("/api/transfers/{id}/history", get(transfer_history))
        .route("/api/transfers/{id}/items", post(add_item))
        .route("/api/transfers/{id}/submit", post(submit_transfer))
        .route("/api/transfers/{id}/qc_approve", post(approve_transfer))
        .route("/api/transfers/{id}/qc_reject", post(reject_transfer))
        .route("/api/transfers/{id}/post", post(post_transfer))
        .route("/api/transfers/{id}/reopen", post(reopen_transfer))
        .route("/api/items/{id}", delete(remove_item))
        .route("/api/items/{id}/serials", get(list_serials).post(add_serial))
        .route("/api/items/{id}/serials/bulk", post(add_serials_bulk))
        .route("/api/serials/{id}", put(edit_serial).delete(remove_serial))
        .route("/api/catalog/items/{code}", get(resolve_item))
        .route("/api/catalog/serials/validate", get(validate_serial))
        .route("/api/warehouses", get(list_warehouses))
        .route("/api/warehouses/{code}/bins", get(list_bins))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn current_user(CurrentActor(actor): CurrentActor) -> Json<Actor> {
    Json(actor)
}

async fn list_transfers(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.service.list(&actor, query).await?;
    Ok(Json(page))
}

async fn create_transfer(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    ApiJson(req): ApiJson<CreateTransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let transfer = state.service.create(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(transfer)))
}

async fn get_transfer(
    State(state): State<SharedState>,
    CurrentActor(_actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get(id).await?))
}

async fn delete_transfer(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn transfer_history(
    State(state): State<SharedState>,
    CurrentActor(_actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.history(id).await?))
}

async fn apply_action(
    state: &SharedState,
    actor: &Actor,
    id: i64,
    action: TransferAction,
    reason: Option<String>,
) -> Result<Response, ApiError> {
    let transfer = state.service.transition(actor, id, action, reason).await?;
    Ok(Json(transfer).into_response())
}

async fn submit_transfer(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    apply_action(&state, &actor, id, TransferAction::Submit, None).await
}

async fn approve_transfer(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    apply_action(&state, &actor, id, TransferAction::QcApprove, None).await
}

async fn reject_transfer(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<TransitionRequest>,
) -> Result<Response, ApiError> {
    apply_action(&state, &actor, id, TransferAction::QcReject, req.reason).await
}

async fn post_transfer(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    apply_action(&state, &actor, id, TransferAction::Post, None).await
}

async fn reopen_transfer(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    apply_action(&state, &actor, id, TransferAction::Reopen, None).await
}

async fn add_item(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(transfer_id): Path<i64>,
    ApiJson(req): ApiJson<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.service.add_item(&actor, transfer_id, req).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn remove_item(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.remove_item(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_serials(
    State(state): State<SharedState>,
    CurrentActor(_actor): CurrentActor,
    Path(item_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.list_serials(item_id).await?))
}

async fn add_serial(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(item_id): Path<i64>,
    ApiJson(req): ApiJson<SerialRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let serial = state.service.add_serial(&actor, item_id, &req.serial).await?;
    Ok((StatusCode::CREATED, Json(serial)))
}

async fn add_serials_bulk(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(item_id): Path<i64>,
    ApiJson(req): ApiJson<BulkSerialRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .service
        .add_serials_bulk(&actor, item_id, &req.serials)
        .await?;
    Ok(Json(result))
}

async fn edit_serial(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<SerialRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.edit_serial(&actor, id, &req.serial).await?))
}

async fn remove_serial(
    State(state): State<SharedState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.remove_serial(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_item(
    State(state): State<SharedState>,
    CurrentActor(_actor): CurrentActor,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.resolve_item(&code).await?))
}

async fn validate_serial(
    State(state): State<SharedState>,
    CurrentActor(_actor): CurrentActor,
    ApiQuery(params): ApiQuery<SerialLookupParams>,
) -> Result<impl IntoResponse, ApiError> {
    let check = state
        .service
        .validate_serial(&params.item_code, &params.serial, &params.location)
        .await?;
    Ok(Json(check))
}

async fn list_warehouses(
    State(state): State<SharedState>,
    CurrentActor(_actor): CurrentActor,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.warehouses().await?))
}

async fn list_bins(
    State(state): State<SharedState>,
    CurrentActor(_actor): CurrentActor,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.bins(&code).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────
