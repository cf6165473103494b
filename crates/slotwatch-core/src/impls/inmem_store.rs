//! InMemoryTaskStore - 開発・テスト用の永続化コラボレータ
//!
//! # 実装詳細
//! - State 全体を 1 つの Mutex で保護（await をまたいで保持しない）
//! - found_slots は単調非減少（小さい値での上書きは無視）
//! - 障害注入: `set_unavailable` / `fail_next` / `fail_status_updates`

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Account, AccountId, Event, SlotKey, StoreError, Task, TaskId, TaskStatus};
use crate::ports::{StatusUpdate, TaskStore};

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    accounts: HashMap<AccountId, Account>,
    events: Vec<Event>,
    attempts: HashSet<(TaskId, SlotKey)>,
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    fail_status_updates: AtomicUsize,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".into()));
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    // ---- seeding / inspection (no failure injection) ----

    pub fn insert_task(&self, task: Task) {
        self.state().tasks.insert(task.id, task);
    }

    pub fn insert_account(&self, account: Account) {
        self.state().accounts.insert(account.id, account);
    }

    pub fn remove_task(&self, id: TaskId) -> Option<Task> {
        self.state().tasks.remove(&id)
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.state().tasks.get(&id).cloned()
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.state().accounts.get(&id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.state().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn events_for(&self, task: TaskId) -> Vec<Event> {
        self.state()
            .events
            .iter()
            .filter(|e| e.task_id == Some(task))
            .cloned()
            .collect()
    }

    /// Every call fails while set.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// The next `n` calls fail, then the store recovers.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Only the next `n` `update_task_status` calls fail.
    pub fn fail_status_updates(&self, n: usize) {
        self.fail_status_updates.store(n, Ordering::SeqCst);
    }
}

fn task_not_found(id: TaskId) -> StoreError {
    StoreError::NotFound {
        what: "task",
        id: id.to_string(),
    }
}

fn account_not_found(id: AccountId) -> StoreError {
    StoreError::NotFound {
        what: "account",
        id: id.to_string(),
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.check()?;
        Ok(self
            .tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Active)
            .collect())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        self.check()?;
        self.task(id).ok_or_else(|| task_not_found(id))
    }

    async fn get_account(&self, id: AccountId) -> Result<Account, StoreError> {
        self.check()?;
        self.account(id).ok_or_else(|| account_not_found(id))
    }

    async fn update_task_status(&self, id: TaskId, update: StatusUpdate) -> Result<(), StoreError> {
        self.check()?;
        let injected = self
            .fail_status_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected status update failure".into()));
        }
        let mut state = self.state();
        let task = state.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.status = update.status;
        if let Some(found) = update.found_slots {
            task.found_slots = task.found_slots.max(found);
        }
        if let Some(at) = update.last_check {
            task.last_check = Some(at);
        }
        Ok(())
    }

    async fn record_event(&self, event: Event) -> Result<(), StoreError> {
        self.check()?;
        self.state().events.push(event);
        Ok(())
    }

    async fn mark_account_inactive(&self, id: AccountId) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state();
        let account = state.accounts.get_mut(&id).ok_or_else(|| account_not_found(id))?;
        account.is_active = false;
        Ok(())
    }

    async fn update_account_last_login(&self, id: AccountId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state();
        let account = state.accounts.get_mut(&id).ok_or_else(|| account_not_found(id))?;
        account.last_login = Some(at);
        Ok(())
    }

    async fn has_booking_attempt(&self, task: TaskId, slot: &SlotKey) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.state().attempts.contains(&(task, slot.clone())))
    }

    async fn record_booking_attempt(&self, task: TaskId, slot: &SlotKey) -> Result<(), StoreError> {
        self.check()?;
        self.state().attempts.insert((task, slot.clone()));
        Ok(())
    }
}
