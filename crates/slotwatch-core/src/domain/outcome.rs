//! Outcome model: result of one search cycle.
//!
//! This is what `worker_status()` reports as "last cycle outcome" and what
//! the worker loop looks at to decide whether to keep going.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::TaskId;
use super::slot::SlotKey;

/// Why a cycle did not talk to the marketplace (or stopped early).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// Rate-limit permit not granted in time (`skipped-ratelimited`).
    RateLimited,
    NoLinkedAccount,
}

/// Classification of a finished cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    NoMatches,
    Matched { count: usize, new: usize },
    Booked { slot_key: SlotKey },
    SlotTaken { attempts: usize },
    BookingFailed { reason: String },
    Skipped { cause: SkipCause },
    Faulted { kind: ErrorKind, reason: String },
    Completed { reason: String },
    Cancelled,
    PersistenceFailed { reason: String },
}

impl CycleOutcome {
    /// Does the worker loop stop after this outcome?
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Faulted { .. } | CycleOutcome::Completed { .. } | CycleOutcome::Cancelled
        )
    }

    /// Must the same cycle be run again (no progress was made)?
    pub fn needs_rerun(&self) -> bool {
        matches!(self, CycleOutcome::PersistenceFailed { .. })
    }
}

/// One cycle, as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
}
