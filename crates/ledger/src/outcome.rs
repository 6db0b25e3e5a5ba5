//! Outcomes of a confirmation and the per-request state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use stockledger_core::ApproverId;

/// Result of a ledger insert attempt.
///
/// A collision on the natural key is not an error: the existing row comes
/// back as `AlreadyRecorded` and nothing is re-applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome<T> {
    Applied(T),
    AlreadyRecorded(T),
}

impl<T> RecordOutcome<T> {
    pub fn record(&self) -> &T {
        match self {
            RecordOutcome::Applied(r) | RecordOutcome::AlreadyRecorded(r) => r,
        }
    }

    pub fn into_record(self) -> T {
        match self {
            RecordOutcome::Applied(r) | RecordOutcome::AlreadyRecorded(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, RecordOutcome::Applied(_))
    }

    pub fn status(&self) -> ConfirmationStatus {
        match self {
            RecordOutcome::Applied(_) => ConfirmationStatus::Recorded,
            RecordOutcome::AlreadyRecorded(_) => ConfirmationStatus::Duplicate,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RecordOutcome<U> {
        match self {
            RecordOutcome::Applied(r) => RecordOutcome::Applied(f(r)),
            RecordOutcome::AlreadyRecorded(r) => RecordOutcome::AlreadyRecorded(f(r)),
        }
    }
}

/// What the caller sees for an accepted confirmation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Recorded,
    Duplicate,
}

impl ConfirmationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmationStatus::Recorded => "recorded",
            ConfirmationStatus::Duplicate => "duplicate",
        }
    }
}

/// Lifecycle of one confirmation request inside the applier.
///
/// `Received → Validated → Recorded → Projected → Notified`, or the terminal
/// short-circuits `Duplicate` (after the insert attempt) and `Rejected`
/// (during validation, before anything is written).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    Received,
    Validated,
    Recorded,
    Projected,
    Notified,
    Duplicate,
    Rejected,
}

impl ConfirmationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConfirmationState::Notified | ConfirmationState::Duplicate | ConfirmationState::Rejected
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ConfirmationState) -> bool {
        use ConfirmationState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, Recorded)
                | (Validated, Duplicate)
                | (Recorded, Projected)
                | (Projected, Notified)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmationState::Received => "received",
            ConfirmationState::Validated => "validated",
            ConfirmationState::Recorded => "recorded",
            ConfirmationState::Projected => "projected",
            ConfirmationState::Notified => "notified",
            ConfirmationState::Duplicate => "duplicate",
            ConfirmationState::Rejected => "rejected",
        }
    }
}

impl core::fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata handed back to a caller, for first applications and replays alike.
///
/// On a duplicate, `approved_at`/`approved_by` are those of the original row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub status: ConfirmationStatus,
    pub ledger_id: i64,
    pub approved_at: DateTime<Utc>,
    pub approved_by: ApproverId,
    /// Final state reached by the request.
    pub state: ConfirmationState,
}

impl Receipt {
    pub fn is_duplicate(&self) -> bool {
        self.status == ConfirmationStatus::Duplicate
    }
}
