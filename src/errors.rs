//! Typed error for transfer operations.
//!
//! `TransferError` is what the service, the persistence layer and the API
//! handlers return. Each variant maps onto one [`ErrorKind`] so callers on
//! both sides of the wire see the same vocabulary.

use stockflow_common::{ErrorKind, GateError, Precondition, TransferAction, TransferStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Transfer {transfer_id} is {status} and cannot be modified")]
    NotEditable {
        transfer_id: i64,
        status: TransferStatus,
    },

    #[error("Cannot {action} a transfer in status {from}")]
    InvalidTransition {
        from: TransferStatus,
        action: TransferAction,
    },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(Precondition),

    #[error("Serial {serial} rejected: {reason}")]
    InvalidSerial { serial: String, reason: String },

    #[error("Serial {serial} is already attached to item {item_id}")]
    DuplicateSerial { serial: String, item_id: i64 },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Not permitted: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("ERP unavailable: {0}")]
    Unavailable(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Attach the transfer id to a gate refusal.
    pub fn from_gate(err: GateError, transfer_id: i64) -> Self {
        match err {
            GateError::InvalidTransition { from, action } => {
                Self::InvalidTransition { from, action }
            }
            GateError::Unauthorized(msg) => Self::Unauthorized(msg),
            GateError::PreconditionFailed(p) => Self::PreconditionFailed(p),
            GateError::NotEditable { status } => Self::NotEditable {
                transfer_id,
                status,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotEditable { .. } => ErrorKind::NotEditable,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::InvalidSerial { .. } => ErrorKind::InvalidSerial,
            Self::DuplicateSerial { .. } => ErrorKind::DuplicateSerial,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::LockPoisoned | Self::Other(_) => ErrorKind::Unknown,
        }
    }

    /// The field or condition implicated, where there is one.
    pub fn field(&self) -> Option<String> {
        match self {
            Self::Validation { field, .. } => Some(field.clone()),
            Self::PreconditionFailed(p) => Some(p.code().to_string()),
            Self::InvalidSerial { .. } | Self::DuplicateSerial { .. } => Some("serial".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_field() {
        let err = TransferError::validation("destination", "must differ from source");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.field().as_deref(), Some("destination"));
        assert_eq!(err.to_string(), "Invalid destination: must differ from source");
    }

    #[test]
    fn test_precondition_field_is_condition_code() {
        let err = TransferError::PreconditionFailed(Precondition::NoItems);
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(err.field().as_deref(), Some("no_items"));
    }

    #[test]
    fn test_gate_errors_map_onto_matching_variants() {
        let err = TransferError::from_gate(
            GateError::NotEditable {
                status: TransferStatus::Posted,
            },
            42,
        );
        match &err {
            TransferError::NotEditable {
                transfer_id,
                status,
            } => {
                assert_eq!(*transfer_id, 42);
                assert_eq!(*status, TransferStatus::Posted);
            }
            _ => panic!("Expected NotEditable"),
        }
        assert!(err.to_string().contains("42"));

        let err = TransferError::from_gate(
            GateError::InvalidTransition {
                from: TransferStatus::Draft,
                action: TransferAction::Reopen,
            },
            1,
        );
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn test_not_found_formats_entity_and_id() {
        let err = TransferError::not_found("Transfer", 7);
        assert_eq!(err.to_string(), "Transfer 7 not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_anyhow_errors_are_unknown() {
        let err: TransferError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(matches!(TransferError::LockPoisoned.kind(), ErrorKind::Unknown));
    }

    #[test]
    fn test_all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TransferError::Conflict("stale".into()));
        assert_std_error(&TransferError::Unavailable("timeout".into()));
    }
}
