//! Closed vocabularies: transfer status, workflow actions, actor roles,
//! transfer priority and per-line QC status.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer. `Draft` is initial; `Posted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    Submitted,
    QcApproved,
    Posted,
    Rejected,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 5] = [
        Self::Draft,
        Self::Submitted,
        Self::QcApproved,
        Self::Posted,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::QcApproved => "qc_approved",
            Self::Posted => "posted",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Posted)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "submitted" => Ok(Self::Submitted),
            "qc_approved" => Ok(Self::QcApproved),
            "posted" => Ok(Self::Posted),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid transfer status: {}", s)),
        }
    }
}

/// A requested workflow transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    Submit,
    QcApprove,
    QcReject,
    Post,
    Reopen,
}

impl TransferAction {
    pub const ALL: [TransferAction; 5] = [
        Self::Submit,
        Self::QcApprove,
        Self::QcReject,
        Self::Post,
        Self::Reopen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::QcApprove => "qc_approve",
            Self::QcReject => "qc_reject",
            Self::Post => "post",
            Self::Reopen => "reopen",
        }
    }
}

impl std::fmt::Display for TransferAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submit" => Ok(Self::Submit),
            "qc_approve" | "approve" => Ok(Self::QcApprove),
            "qc_reject" | "reject" => Ok(Self::QcReject),
            "post" => Ok(Self::Post),
            "reopen" => Ok(Self::Reopen),
            _ => Err(format!("Invalid transfer action: {}", s)),
        }
    }
}

/// The transition table. Any (status, action) pair not listed here is an
/// invalid transition.
pub const TRANSITIONS: [(TransferStatus, TransferAction, TransferStatus); 5] = [
    (TransferStatus::Draft, TransferAction::Submit, TransferStatus::Submitted),
    (TransferStatus::Submitted, TransferAction::QcApprove, TransferStatus::QcApproved),
    (TransferStatus::Submitted, TransferAction::QcReject, TransferStatus::Rejected),
    (TransferStatus::QcApproved, TransferAction::Post, TransferStatus::Posted),
    (TransferStatus::Rejected, TransferAction::Reopen, TransferStatus::Draft),
];

/// Look up the target status for `action` taken from `from`.
pub fn transition_target(from: TransferStatus, action: TransferAction) -> Option<TransferStatus> {
    TRANSITIONS
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
}

/// Role of the acting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Qc,
    Manager,
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Self::User, Self::Qc, Self::Manager, Self::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Qc => "qc",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }

    /// Manager or admin.
    pub fn is_supervisor(&self) -> bool {
        matches!(self, Self::Manager | Self::Admin)
    }

    /// May approve or reject submitted transfers.
    pub fn can_review(&self) -> bool {
        matches!(self, Self::Qc | Self::Manager | Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "qc" => Ok(Self::Qc),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// QC outcome recorded on each line when the transfer is reviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineQcStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl LineQcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for LineQcStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid line QC status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TransferStatus::ALL {
            assert_eq!(TransferStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(TransferStatus::from_str("reopened").is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TransferStatus::QcApproved).unwrap();
        assert_eq!(json, "\"qc_approved\"");
    }

    #[test]
    fn test_action_accepts_short_aliases() {
        assert_eq!(TransferAction::from_str("approve").unwrap(), TransferAction::QcApprove);
        assert_eq!(TransferAction::from_str("reject").unwrap(), TransferAction::QcReject);
        assert!(TransferAction::from_str("cancel").is_err());
    }

    #[test]
    fn test_transition_table_targets() {
        assert_eq!(
            transition_target(TransferStatus::Draft, TransferAction::Submit),
            Some(TransferStatus::Submitted)
        );
        assert_eq!(
            transition_target(TransferStatus::Rejected, TransferAction::Reopen),
            Some(TransferStatus::Draft)
        );
        assert_eq!(transition_target(TransferStatus::Posted, TransferAction::Reopen), None);
        assert_eq!(transition_target(TransferStatus::Draft, TransferAction::Post), None);
    }

    #[test]
    fn test_posted_has_no_outgoing_transitions() {
        assert!(TransferStatus::Posted.is_terminal());
        for action in TransferAction::ALL {
            assert!(transition_target(TransferStatus::Posted, action).is_none());
        }
    }

    #[test]
    fn test_role_capabilities() {
        assert!(!Role::User.can_review());
        assert!(Role::Qc.can_review());
        assert!(!Role::Qc.is_supervisor());
        assert!(Role::Manager.is_supervisor());
        assert!(Role::Admin.is_supervisor());
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
    }

    #[test]
    fn test_priority_default_is_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!("urgent".parse::<Priority>().unwrap(), Priority::Urgent);
    }
}
