//! Task - スロット検索タスクと検索条件
//!
//! Task レコード自体は外部の永続化コラボレータが持ち主。
//! コアが書き換えるのは status / found_slots / last_check だけです。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, OwnerId, TaskId};

/// Packaging type of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packaging {
    Boxes,
    Pallets,
}

impl Packaging {
    pub fn as_str(self) -> &'static str {
        match self {
            Packaging::Boxes => "boxes",
            Packaging::Pallets => "pallets",
        }
    }
}

impl fmt::Display for Packaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Packaging {
    type Err = CriteriaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "boxes" => Ok(Packaging::Boxes),
            "pallets" => Ok(Packaging::Pallets),
            other => Err(CriteriaError::UnknownPackaging(other.to_string())),
        }
    }
}

/// Persisted run state of a task.
///
/// State transitions (see `domain::state::transition`):
/// - Pending -> Active
/// - Active -> Paused | Completed | Error
/// - Paused -> Active
/// - Error -> Active (explicit operator restart)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }

    /// Should a worker be running for a task in this state?
    pub fn wants_worker(self) -> bool {
        matches!(self, TaskStatus::Active)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed search criteria.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CriteriaError {
    #[error("date_from {from} is after date_to {to}")]
    InvertedDateRange { from: NaiveDate, to: NaiveDate },

    #[error("min_coefficient must be a positive number, got {0}")]
    NonPositiveCoefficient(f64),

    #[error("warehouse must not be empty")]
    EmptyWarehouse,

    #[error("unknown packaging type '{0}'")]
    UnknownPackaging(String),
}

/// Validated search criteria of a task.
///
/// フィールドは private。`SearchCriteria::new` を通った値だけが存在する。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCriteria {
    warehouse: String,
    date_from: NaiveDate,
    date_to: NaiveDate,
    min_coefficient: f64,
    packaging: Packaging,
}

impl SearchCriteria {
    pub fn new(
        warehouse: impl Into<String>,
        date_from: NaiveDate,
        date_to: NaiveDate,
        min_coefficient: f64,
        packaging: Packaging,
    ) -> Result<Self, CriteriaError> {
        let warehouse = warehouse.into().trim().to_string();
        if warehouse.is_empty() {
            return Err(CriteriaError::EmptyWarehouse);
        }
        if date_from > date_to {
            return Err(CriteriaError::InvertedDateRange {
                from: date_from,
                to: date_to,
            });
        }
        // NaN も弾く（NaN > 0.0 は false）
        if !(min_coefficient.is_finite() && min_coefficient > 0.0) {
            return Err(CriteriaError::NonPositiveCoefficient(min_coefficient));
        }
        Ok(Self {
            warehouse,
            date_from,
            date_to,
            min_coefficient,
            packaging,
        })
    }

    pub fn warehouse(&self) -> &str {
        &self.warehouse
    }

    pub fn date_from(&self) -> NaiveDate {
        self.date_from
    }

    pub fn date_to(&self) -> NaiveDate {
        self.date_to
    }

    pub fn min_coefficient(&self) -> f64 {
        self.min_coefficient
    }

    pub fn packaging(&self) -> Packaging {
        self.packaging
    }

    /// Has the whole window passed relative to `today`?
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        today > self.date_to
    }
}

/// Snapshot of a task as handed over by the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner: OwnerId,
    pub name: String,
    pub warehouse: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub min_coefficient: f64,
    pub packaging: Packaging,
    #[serde(default)]
    pub linked_account: Option<AccountId>,
    #[serde(default)]
    pub auto_book: bool,
    pub status: TaskStatus,
    #[serde(default)]
    pub found_slots: u32,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    /// Overrides `scheduler.default_interval_secs` when present.
    #[serde(default)]
    pub interval_minutes: Option<u32>,
}

impl Task {
    /// Convenience constructor for a freshly created (pending) task.
    pub fn new(
        owner: OwnerId,
        name: impl Into<String>,
        criteria: &SearchCriteria,
        linked_account: Option<AccountId>,
        auto_book: bool,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            owner,
            name: name.into(),
            warehouse: criteria.warehouse().to_string(),
            date_from: criteria.date_from(),
            date_to: criteria.date_to(),
            min_coefficient: criteria.min_coefficient(),
            packaging: criteria.packaging(),
            linked_account,
            auto_book,
            status: TaskStatus::Pending,
            found_slots: 0,
            last_check: None,
            interval_minutes: None,
        }
    }

    /// Re-validate the raw fields; the record may come from anywhere.
    pub fn criteria(&self) -> Result<SearchCriteria, CriteriaError> {
        SearchCriteria::new(
            self.warehouse.clone(),
            self.date_from,
            self.date_to,
            self.min_coefficient,
            self.packaging,
        )
    }

    pub fn interval(&self, default: Duration) -> Duration {
        match self.interval_minutes {
            Some(minutes) if minutes > 0 => Duration::from_secs(u64::from(minutes) * 60),
            _ => default,
        }
    }
}
