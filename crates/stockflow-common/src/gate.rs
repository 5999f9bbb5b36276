//! Workflow gate: the single place where transfer life-cycle rules live.
//!
//! The gate is a pure function of (current status, requested action, actor,
//! record contents). It performs no I/O. The server runs it before
//! persisting a transition; the client runs the same code to decide which
//! controls to offer. The server's verdict is always the authoritative one.
//!
//! | From          | Action       | To            | Who                      |
//! |---------------|--------------|---------------|--------------------------|
//! | `draft`       | `submit`     | `submitted`   | owner, manager, admin    |
//! | `submitted`   | `qc_approve` | `qc_approved` | qc, manager, admin       |
//! | `submitted`   | `qc_reject`  | `rejected`    | qc, manager, admin       |
//! | `qc_approved` | `post`       | `posted`      | manager, admin           |
//! | `rejected`    | `reopen`     | `draft`       | owner, manager, admin    |

use crate::error::{GateError, Precondition};
use crate::models::{Actor, TransferDetail, TransferSummary};
use crate::status::{LineQcStatus, TransferAction, TransferStatus, transition_target};

/// The parts of a transfer the gate looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub status: TransferStatus,
    pub owner_id: i64,
    pub item_count: usize,
    /// Codes of serial-tracked items that have no serial number yet.
    pub unserialized_items: Vec<String>,
}

impl From<&TransferDetail> for Subject {
    fn from(detail: &TransferDetail) -> Self {
        Self {
            status: detail.transfer.status,
            owner_id: detail.transfer.owner_id,
            item_count: detail.items_count(),
            unserialized_items: detail.items_missing_serials(),
        }
    }
}

impl From<&TransferSummary> for Subject {
    fn from(summary: &TransferSummary) -> Self {
        Self {
            status: summary.transfer.status,
            owner_id: summary.transfer.owner_id,
            item_count: usize::try_from(summary.items_count).unwrap_or(0),
            unserialized_items: summary.items_missing_serials.clone(),
        }
    }
}

/// A field change applied together with the status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ClearQcNotes,
    SetQcNotes(String),
    StampReviewer,
    ClearReviewer,
    SetLineQc(LineQcStatus),
}

/// An accepted transition: the new status plus the effects to persist with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub action: TransferAction,
    pub from: TransferStatus,
    pub to: TransferStatus,
    pub effects: Vec<Effect>,
}

impl Outcome {
    /// QC notes after the effects are applied, given the notes before.
    pub fn qc_notes_after(&self, before: Option<&str>) -> Option<String> {
        let mut notes = before.map(str::to_string);
        for effect in &self.effects {
            match effect {
                Effect::ClearQcNotes => notes = None,
                Effect::SetQcNotes(n) => notes = Some(n.clone()),
                _ => {}
            }
        }
        notes
    }
}

/// Decide whether `actor` may take `action` on `subject`.
///
/// Checks run in a fixed order: the transition table first, then the
/// actor's authority, then the record preconditions.
pub fn evaluate(
    subject: &Subject,
    actor: &Actor,
    action: TransferAction,
    reason: Option<&str>,
) -> Result<Outcome, GateError> {
    let to = transition_target(subject.status, action).ok_or(GateError::InvalidTransition {
        from: subject.status,
        action,
    })?;
    authorize(subject, actor, action)?;
    check_preconditions(subject, action, reason)?;

    let effects = match action {
        TransferAction::Submit => vec![Effect::ClearQcNotes],
        TransferAction::QcApprove => vec![
            Effect::StampReviewer,
            Effect::SetLineQc(LineQcStatus::Approved),
        ],
        TransferAction::QcReject => vec![
            // check_preconditions guarantees a non-blank reason here
            Effect::SetQcNotes(reason.map(str::trim).unwrap_or_default().to_string()),
            Effect::StampReviewer,
            Effect::SetLineQc(LineQcStatus::Rejected),
        ],
        TransferAction::Post => Vec::new(),
        TransferAction::Reopen => vec![
            Effect::ClearQcNotes,
            Effect::ClearReviewer,
            Effect::SetLineQc(LineQcStatus::Pending),
        ],
    };

    Ok(Outcome {
        action,
        from: subject.status,
        to,
        effects,
    })
}

fn is_owner_or_supervisor(subject: &Subject, actor: &Actor) -> bool {
    actor.user_id == subject.owner_id || actor.role.is_supervisor()
}

fn authorize(subject: &Subject, actor: &Actor, action: TransferAction) -> Result<(), GateError> {
    let allowed = match action {
        TransferAction::Submit | TransferAction::Reopen => is_owner_or_supervisor(subject, actor),
        TransferAction::QcApprove | TransferAction::QcReject => actor.role.can_review(),
        TransferAction::Post => actor.role.is_supervisor(),
    };
    if allowed {
        return Ok(());
    }
    let who = match action {
        TransferAction::Submit | TransferAction::Reopen => "the owner, a manager or an admin",
        TransferAction::QcApprove | TransferAction::QcReject => "a QC reviewer, manager or admin",
        TransferAction::Post => "a manager or admin",
    };
    Err(GateError::Unauthorized(format!(
        "only {} may {} this transfer",
        who, action
    )))
}

fn check_preconditions(
    subject: &Subject,
    action: TransferAction,
    reason: Option<&str>,
) -> Result<(), GateError> {
    match action {
        TransferAction::Submit => {
            if subject.item_count == 0 {
                return Err(GateError::PreconditionFailed(Precondition::NoItems));
            }
            if !subject.unserialized_items.is_empty() {
                return Err(GateError::PreconditionFailed(Precondition::MissingSerials {
                    item_codes: subject.unserialized_items.clone(),
                }));
            }
        }
        TransferAction::QcReject => {
            if reason.is_none_or(|r| r.trim().is_empty()) {
                return Err(GateError::PreconditionFailed(
                    Precondition::MissingRejectionReason,
                ));
            }
        }
        TransferAction::QcApprove | TransferAction::Post | TransferAction::Reopen => {}
    }
    Ok(())
}

/// Items and serials are mutable only in draft, and only by the owner,
/// a manager or an admin.
pub fn is_editable(subject: &Subject, actor: &Actor) -> bool {
    subject.status == TransferStatus::Draft && is_owner_or_supervisor(subject, actor)
}

/// Like [`is_editable`] but says why not.
pub fn ensure_editable(subject: &Subject, actor: &Actor) -> Result<(), GateError> {
    if subject.status != TransferStatus::Draft {
        return Err(GateError::NotEditable {
            status: subject.status,
        });
    }
    if !is_owner_or_supervisor(subject, actor) {
        return Err(GateError::Unauthorized(
            "only the owner, a manager or an admin may modify this transfer".to_string(),
        ));
    }
    Ok(())
}

/// Actions to offer `actor` for this record. A rejection reason is
/// collected at action time, so `qc_reject` is offered without one.
pub fn allowed_actions(subject: &Subject, actor: &Actor) -> Vec<TransferAction> {
    TransferAction::ALL
        .into_iter()
        .filter(|action| {
            transition_target(subject.status, *action).is_some()
                && authorize(subject, actor, *action).is_ok()
                && (*action == TransferAction::QcReject
                    || check_preconditions(subject, *action, None).is_ok())
        })
        .collect()
}
