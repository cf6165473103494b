//! TaskStore port - 永続化コラボレータ（Task / Account / Event の正本）
//!
//! コアはここを通してだけ永続化に触る。
//! - 読み取りはスナップショット
//! - 書き込みは許可された単一フィールド更新だけ（複数レコードのトランザクションはしない）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Account, AccountId, Event, SlotKey, StoreError, Task, TaskId, TaskStatus};

/// Single-record status write.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub found_slots: Option<u32>,
    pub last_check: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            found_slots: None,
            last_check: None,
        }
    }

    pub fn with_found_slots(mut self, found_slots: u32) -> Self {
        self.found_slots = Some(found_slots);
        self
    }

    pub fn with_last_check(mut self, at: DateTime<Utc>) -> Self {
        self.last_check = Some(at);
        self
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_active_tasks(&self) -> Result<Vec<Task>, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError>;

    async fn get_account(&self, id: AccountId) -> Result<Account, StoreError>;

    async fn update_task_status(&self, id: TaskId, update: StatusUpdate) -> Result<(), StoreError>;

    async fn record_event(&self, event: Event) -> Result<(), StoreError>;

    async fn mark_account_inactive(&self, id: AccountId) -> Result<(), StoreError>;

    async fn update_account_last_login(&self, id: AccountId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Persisted half of the double-booking guard.
    async fn has_booking_attempt(&self, task: TaskId, slot: &SlotKey) -> Result<bool, StoreError>;

    async fn record_booking_attempt(&self, task: TaskId, slot: &SlotKey) -> Result<(), StoreError>;
}
