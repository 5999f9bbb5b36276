//! Transfer server: REST back-end for inventory transfers between
//! warehouse locations.
//!
//! ## Overview
//!
//! Transfers are created as drafts, filled with items and serial numbers,
//! then moved through QC review to posting. Every state change passes the
//! shared workflow gate (`stockflow_common::gate`) before it is written, and
//! every committed mutation is broadcast on a WebSocket change feed.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │  (sync)  │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ TransferService::transition()          │
//!                       │         v                                        │
//!                       │  service.rs  (gate + persistence + ERP)          │
//!                       │         │                  │                     │
//!                       │         v                  v                     │
//!                       │  db.rs (SQLite)     erp.rs (SAP B1 / catalog)    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `db`      | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `erp`     | `Erp` trait, SAP Service Layer client, in-memory catalog    |
//! | `ws`      | `TransferEvent` enum + `broadcast_event()` helper           |
//!
//! ## Typical Request Flow (post a transfer)
//!
//! 1. `POST /api/transfers/{id}/post` → `api::post_transfer()`
//! 2. The service loads the transfer with items and serials and asks the
//!    gate; a refusal is returned without touching anything.
//! 3. The ERP receives the stock transfer document and returns its number.
//!    If the ERP is down the request fails with `unavailable` and the
//!    transfer stays `qc_approved`.
//! 4. `db::apply_transition()` updates status, effects and history in one
//!    transaction guarded on the status the gate saw.
//! 5. A `StatusChanged` event goes out on `/ws`.

pub mod api;
pub mod db;
pub mod erp;
pub mod server;
pub mod service;
pub mod ws;
