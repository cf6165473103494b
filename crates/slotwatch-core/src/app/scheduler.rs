//! TaskScheduler - タスクごとのワーカーのライフサイクルを管理する
//!
//! # 不変条件
//! - 1 タスクにつき動いているワーカーは高々 1 つ
//! - 同じタスクへの制御操作（start / pause / stop / delete）はタスク単位の
//!   非同期ロック（gate）で直列化する。別タスク同士は互いを待たない
//! - 状態遷移は `domain::transition` が決め、ここでは Effect を実行するだけ
//!
//! ワーカーを止めるときは cancel → join の順。in-flight の呼び出しは
//! 終わるか `call_timeout` に達するまで待つ。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::booking::BookingCoordinator;
use super::builder::SchedulerBuilder;
use super::notify::NotificationDispatcher;
use super::status::{TaskWorkerStatus, WorkerStatus};
use super::worker_loop::WorkerLoop;
use crate::cancel::CancelHandle;
use crate::config::SchedulerConfig;
use crate::domain::{
    CycleReport, Effect, ErrorKind, Event, StoreError, Task, TaskId, TaskStatus, Transition,
    TransitionError, Trigger, transition,
};
use crate::ports::{Clock, Marketplace, StatusUpdate, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl SchedulerError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SchedulerError::Store(e) => Some(e.kind()),
            SchedulerError::Transition(_) => None,
        }
    }
}

/// What `reconcile()` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub started: Vec<TaskId>,
    pub retired: Vec<TaskId>,
}

struct WorkerSlot {
    cancel: CancelHandle,
    join: JoinHandle<()>,
    generation: u64,
}

#[derive(Debug, Clone)]
struct CycleInfo {
    interval: Duration,
    last: CycleReport,
}

/// State shared between the scheduler handle and its workers.
pub(crate) struct Shared<M: Marketplace> {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) marketplace: Arc<M>,
    pub(crate) booking: BookingCoordinator<M>,
    pub(crate) dispatcher: NotificationDispatcher,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: SchedulerConfig,
    workers: Mutex<HashMap<TaskId, WorkerSlot>>,
    gates: Mutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>,
    cycles: Mutex<HashMap<TaskId, CycleInfo>>,
    generation: AtomicU64,
}

impl<M: Marketplace> Shared<M> {
    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, WorkerSlot>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cycles(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CycleInfo>> {
        self.cycles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gate(&self, id: TaskId) -> Arc<AsyncMutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(gates.entry(id).or_default())
    }

    fn is_running(&self, id: TaskId) -> bool {
        self.workers()
            .get(&id)
            .is_some_and(|slot| !slot.join.is_finished())
    }

    /// Record then publish. The event is only published once it is persisted.
    pub(crate) async fn emit(&self, event: Event) -> Result<(), StoreError> {
        self.store.record_event(event.clone()).await?;
        self.dispatcher.publish(&event);
        Ok(())
    }

    /// Carry out the persistence side of a transition.
    pub(crate) async fn apply(&self, task: &Task, transition: &Transition) -> Result<(), StoreError> {
        for effect in &transition.effects {
            if let Effect::PersistStatus(status) = effect {
                let mut update = StatusUpdate::status(*status);
                if transition.from == TaskStatus::Active {
                    update = update.with_last_check(self.clock.now());
                }
                self.store.update_task_status(task.id, update).await?;
            }
        }
        if let Some(event) = transition.event(task.id, &task.name, self.clock.now()) {
            self.emit(event).await?;
        }
        info!(
            task_id = %task.id,
            from = %transition.from,
            to = ?transition.to,
            reason = %transition.reason,
            "task transition"
        );
        Ok(())
    }

    pub(crate) fn record_cycle(&self, last: CycleReport, interval: Duration) {
        self.cycles().insert(last.task_id, CycleInfo { interval, last });
    }

    /// Called by a worker on its way out.
    pub(crate) fn worker_exited(&self, id: TaskId, generation: u64) {
        let mut workers = self.workers();
        if workers.get(&id).is_some_and(|slot| slot.generation == generation) {
            workers.remove(&id);
        }
    }
}

/// Owns one worker per active task.
pub struct TaskScheduler<M: Marketplace> {
    shared: Arc<Shared<M>>,
}

impl<M: Marketplace> Clone for TaskScheduler<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Marketplace> TaskScheduler<M> {
    pub fn builder(marketplace: Arc<M>, store: Arc<dyn TaskStore>) -> SchedulerBuilder<M> {
        SchedulerBuilder::new(marketplace, store)
    }

    pub(crate) fn from_parts(
        store: Arc<dyn TaskStore>,
        marketplace: Arc<M>,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let booking = BookingCoordinator::new(
            Arc::clone(&marketplace),
            Arc::clone(&store),
            config.max_booking_attempts_per_cycle,
        );
        Self {
            shared: Arc::new(Shared {
                store,
                marketplace,
                booking,
                dispatcher,
                clock,
                config,
                workers: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                cycles: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn marketplace(&self) -> &Arc<M> {
        &self.shared.marketplace
    }

    /// Start (or resume, or restart out of `error`). Idempotent.
    pub async fn start(&self, id: TaskId) -> Result<TaskStatus, SchedulerError> {
        self.control(id, Trigger::Start).await
    }

    /// Stop the worker and keep the task `paused`. Idempotent.
    pub async fn pause(&self, id: TaskId) -> Result<TaskStatus, SchedulerError> {
        self.control(id, Trigger::Pause).await
    }

    /// Detach the worker without changing the persisted status. Idempotent.
    pub async fn stop(&self, id: TaskId) -> Result<TaskStatus, SchedulerError> {
        self.control(id, Trigger::Stop).await
    }

    /// Retire the worker ahead of the owning API removing the record.
    pub async fn delete(&self, id: TaskId) -> Result<(), SchedulerError> {
        let gate = self.shared.gate(id);
        let _held = gate.lock().await;
        self.retire(id).await;
        match self.shared.store.get_task(id).await {
            Ok(task) => {
                let t = transition(task.status, &Trigger::Delete)?;
                self.shared.apply(&task, &t).await?;
            }
            Err(StoreError::NotFound { .. }) => debug!(task_id = %id, "deleted task already gone"),
            Err(e) => return Err(e.into()),
        }
        self.shared.cycles().remove(&id);
        Ok(())
    }

    async fn control(&self, id: TaskId, trigger: Trigger) -> Result<TaskStatus, SchedulerError> {
        let gate = self.shared.gate(id);
        let _held = gate.lock().await;

        let mut task = self.shared.store.get_task(id).await?;
        let mut t = transition(task.status, &trigger)?;
        if t.has(Effect::RetireWorker) {
            self.retire(id).await;
            // ワーカーが最後のサイクルで状態を変えているかもしれない
            let fresh = self.shared.store.get_task(id).await?;
            if fresh.status != task.status {
                t = transition(fresh.status, &trigger)?;
            }
            task = fresh;
        }
        if t.is_noop() {
            debug!(task_id = %id, trigger = trigger.name(), status = %task.status, "nothing to do");
            return Ok(task.status);
        }

        self.shared.apply(&task, &t).await?;
        if t.has(Effect::SpawnWorker) {
            if t.from != TaskStatus::Active {
                // 前のワーカーが fault / complete の後始末中なら終わるのを待つ
                self.retire(id).await;
            }
            self.spawn(id);
        }
        Ok(t.target_status().unwrap_or(task.status))
    }

    fn spawn(&self, id: TaskId) {
        // 登録と spawn を同じロックの中で行う（worker_exited と競合しない）
        let mut workers = self.shared.workers();
        if workers.get(&id).is_some_and(|slot| !slot.join.is_finished()) {
            debug!(task_id = %id, "worker already running");
            return;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel, signal) = CancelHandle::new();
        let worker = WorkerLoop::new(Arc::clone(&self.shared), id, generation, signal);
        let join = tokio::spawn(worker.run());
        workers.insert(
            id,
            WorkerSlot {
                cancel,
                join,
                generation,
            },
        );
    }

    /// Cancel and wait for the task's worker, if any.
    async fn retire(&self, id: TaskId) {
        let Some(slot) = self.shared.workers().remove(&id) else {
            return;
        };
        slot.cancel.cancel();
        if let Err(e) = slot.join.await {
            warn!(task_id = %id, error = %e, "worker ended abnormally");
        }
    }

    /// Bring workers in line with persistence: start missing ones for
    /// `active` tasks, retire those whose task is no longer `active`.
    pub async fn reconcile(&self) -> Result<Reconciled, SchedulerError> {
        let active = self.shared.store.list_active_tasks().await?;
        let active_ids: HashSet<TaskId> = active.iter().map(|t| t.id).collect();
        let mut report = Reconciled::default();

        for task in &active {
            if !self.shared.is_running(task.id) {
                self.control(task.id, Trigger::Start).await?;
                report.started.push(task.id);
            }
        }

        let stale: Vec<TaskId> = self
            .shared
            .workers()
            .keys()
            .filter(|id| !active_ids.contains(id))
            .copied()
            .collect();
        for id in stale {
            let gate = self.shared.gate(id);
            let _held = gate.lock().await;
            self.retire(id).await;
            report.retired.push(id);
        }

        if !report.started.is_empty() || !report.retired.is_empty() {
            info!(started = report.started.len(), retired = report.retired.len(), "workers reconciled");
        }
        Ok(report)
    }

    pub fn running(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .shared
            .workers()
            .iter()
            .filter(|(_, slot)| !slot.join.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn worker_status(&self) -> WorkerStatus {
        let running = self.running();
        let cycles = self.shared.cycles().clone();
        let default_interval = self.shared.config.default_interval();

        let mut ids: Vec<TaskId> = running.iter().copied().chain(cycles.keys().copied()).collect();
        ids.sort();
        ids.dedup();

        let tasks = ids
            .into_iter()
            .map(|id| {
                let info = cycles.get(&id);
                TaskWorkerStatus {
                    task_id: id,
                    running: running.contains(&id),
                    interval_secs: info.map_or(default_interval, |i| i.interval).as_secs(),
                    last_cycle: info.map(|i| i.last.clone()),
                }
            })
            .collect();

        WorkerStatus {
            running,
            tasks,
            rate_limits: self.shared.marketplace.rate_saturation(),
            notification_channels: self.shared.dispatcher.channels(),
        }
    }

    /// Stop every worker, then drain the notification queues.
    pub async fn shutdown(&self) {
        let slots: Vec<(TaskId, WorkerSlot)> = self.shared.workers().drain().collect();
        info!(workers = slots.len(), "shutting down scheduler");
        for (_, slot) in &slots {
            slot.cancel.cancel();
        }
        for (id, slot) in slots {
            if let Err(e) = slot.join.await {
                warn!(task_id = %id, error = %e, "worker ended abnormally");
            }
        }
        self.shared.dispatcher.shutdown().await;
    }
}
