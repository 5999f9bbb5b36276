//! Shared domain types for Stockflow: the transfer status vocabulary, the
//! workflow gate, the transfer data model and the error vocabulary.
//!
//! Nothing in this crate performs I/O; it is linked into both the server and
//! the sync client so both evaluate the same rules.

pub mod error;
pub mod gate;
pub mod models;
pub mod status;

pub use error::{ErrorBody, ErrorKind, GateError, Precondition};
pub use gate::{Effect, Outcome, Subject};
pub use models::*;
pub use status::{LineQcStatus, Priority, Role, TransferAction, TransferStatus};
