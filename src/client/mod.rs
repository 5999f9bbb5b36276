//! Client side of the transfer workflow.
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `sync`        | `TransferApi` trait, HTTP `SyncClient`, `SyncError`     |
//! | `coordinator` | `ListCoordinator`: filters, paging, per-row affordances |

pub mod coordinator;
pub mod sync;

pub use coordinator::{Clock, ListCoordinator, RowView, SystemClock};
pub use sync::{SyncClient, SyncError, SyncResult, TransferApi};
