//! Error vocabulary shared by the server, the gate and the sync client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::{TransferAction, TransferStatus};

/// Normalized failure category. Server responses carry it in the `kind`
/// field; the sync client maps every transport failure onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotEditable,
    InvalidTransition,
    PreconditionFailed,
    InvalidSerial,
    DuplicateSerial,
    NotFound,
    Unauthorized,
    Conflict,
    Unavailable,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotEditable => "not_editable",
            Self::InvalidTransition => "invalid_transition",
            Self::PreconditionFailed => "precondition_failed",
            Self::InvalidSerial => "invalid_serial",
            Self::DuplicateSerial => "duplicate_serial",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition precondition that was not met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Precondition {
    NoItems,
    MissingSerials { item_codes: Vec<String> },
    MissingRejectionReason,
}

impl Precondition {
    /// Stable machine-readable code, reported as the error `field`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoItems => "no_items",
            Self::MissingSerials { .. } => "missing_serials",
            Self::MissingRejectionReason => "missing_rejection_reason",
        }
    }
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoItems => f.write_str("transfer has no items"),
            Self::MissingSerials { item_codes } => write!(
                f,
                "serial-tracked items without serial numbers: {}",
                item_codes.join(", ")
            ),
            Self::MissingRejectionReason => f.write_str("rejection reason is required"),
        }
    }
}

/// Why the workflow gate refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("Cannot {action} a transfer in status {from}")]
    InvalidTransition {
        from: TransferStatus,
        action: TransferAction,
    },

    #[error("Not permitted: {0}")]
    Unauthorized(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(Precondition),

    #[error("Transfer is {status} and cannot be modified")]
    NotEditable { status: TransferStatus },
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::NotEditable { .. } => ErrorKind::NotEditable,
        }
    }
}

/// JSON error body returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(default)]
    pub field: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::PreconditionFailed).unwrap();
        assert_eq!(json, "\"precondition_failed\"");
        let kind: ErrorKind = serde_json::from_str("\"duplicate_serial\"").unwrap();
        assert_eq!(kind, ErrorKind::DuplicateSerial);
        assert_eq!(ErrorKind::NotEditable.as_str(), "not_editable");
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_precondition_codes_and_messages() {
        let missing = Precondition::MissingSerials {
            item_codes: vec!["ITM-1".into(), "ITM-2".into()],
        };
        assert_eq!(missing.code(), "missing_serials");
        assert!(missing.to_string().contains("ITM-1, ITM-2"));
        assert_eq!(Precondition::NoItems.code(), "no_items");
    }

    #[test]
    fn test_gate_error_kinds() {
        let err = GateError::InvalidTransition {
            from: TransferStatus::Posted,
            action: TransferAction::Reopen,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(err.to_string(), "Cannot reopen a transfer in status posted");
        let err = GateError::PreconditionFailed(Precondition::MissingRejectionReason);
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_error_body_field_defaults_to_none() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"error":"gone","kind":"not_found"}"#).unwrap();
        assert_eq!(body.kind, ErrorKind::NotFound);
        assert!(body.field.is_none());
    }
}
