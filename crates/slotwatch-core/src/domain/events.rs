//! Events - ドメインイベント（追記のみ）
//!
//! 観測可能な状態を変えたコンポーネントは必ず Event を残す。
//! Event は作成後に変更しない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::{AccountId, TaskId};
use super::slot::SlotKey;
use super::task::TaskStatus;

/// Severity of an event.
///
/// `Ord` は通知フィルタ（min_severity）で使う: Info < Success < Warning < Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// What happened, in machine-readable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Task lifecycle transition.
    StatusChanged {
        from: TaskStatus,
        to: Option<TaskStatus>,
    },
    SlotsFound {
        count: usize,
    },
    SlotBooked {
        slot_key: SlotKey,
    },
    SlotTaken {
        slot_key: SlotKey,
    },
    BookingFailed {
        slot_key: SlotKey,
    },
    CycleSkipped,
    CycleFailed {
        error: ErrorKind,
    },
    WorkerStopped,
    /// A notification channel gave up on an event.
    ChannelFailure {
        channel: String,
    },
}

/// Append-only domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub account_id: Option<AccountId>,
    pub severity: Severity,
    pub kind: EventKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(severity: Severity, kind: EventKind, message: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            task_id: None,
            account_id: None,
            severity,
            kind,
            message: message.into(),
            created_at,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn for_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Channel that failed, if this event reports a notification failure.
    pub fn failed_channel(&self) -> Option<&str> {
        match &self.kind {
            EventKind::ChannelFailure { channel } => Some(channel),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_for_filtering() {
        assert!(Severity::Info < Severity::Success);
        assert!(Severity::Success < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn event_kind_is_tagged() {
        let event = Event::new(
            Severity::Warning,
            EventKind::ChannelFailure {
                channel: "email".to_string(),
            },
            "email down",
            Utc::now(),
        )
        .for_task(TaskId::generate());

        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["kind"]["kind"], "channel_failure");
        assert_eq!(v["severity"], "warning");
        assert_eq!(event.failed_channel(), Some("email"));
    }
}
