//! WorkerLoop - タスク 1 つ分の検索サイクルを回す
//!
//! # フロー（1 サイクル）
//! 1. TaskStore から Task のスナップショットを読む（active でなければ終了）
//! 2. 条件の検証 / 期間切れなら completed
//! 3. authenticate → search → SlotMatcher::filter
//! 4. auto_book なら BookingCoordinator::book_best
//! 5. found_slots / last_check を保存 → Event を記録 → 通知に流す
//! 6. セッションを返却し、次のサイクルまで眠る（キャンセルで起きる）
//!
//! サイクル内で起きた失敗はここで分類し、状態遷移か Event に変える。
//! 永続化コラボレータが使えないときだけ、同じサイクルを後でやり直す。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::booking::{BookingError, BookingRun};
use super::matcher;
use super::scheduler::Shared;
use crate::cancel::CancelSignal;
use crate::domain::{
    Account, CycleOutcome, CycleReport, ErrorKind, Event, EventKind, MarketplaceError, SearchCriteria, Severity,
    SkipCause, SlotKey, StoreError, Task, TaskId, TaskStatus, Trigger,
};
use crate::ports::{Marketplace, StatusUpdate};

pub(crate) struct WorkerLoop<M: Marketplace> {
    shared: Arc<Shared<M>>,
    task_id: TaskId,
    generation: u64,
    cancel: CancelSignal,
    interval: Duration,
    /// Matches already reported by this worker (auto_book = false).
    seen: HashSet<SlotKey>,
    /// Booking result whose bookkeeping did not reach persistence yet.
    pending: Option<PendingBooking>,
}

/// A finished `book_best` run and how far its bookkeeping got.
///
/// 予約そのものはやり直せないので、永続化に失敗したら次のサイクルでは
/// 検索も予約もせず、この結果の後始末だけを再開する。
#[derive(Debug)]
struct PendingBooking {
    matched: usize,
    run: BookingRun,
    persisted: bool,
    emitted: usize,
    /// The run itself failed on persistence; a re-run searches again.
    abandon: bool,
}

impl PendingBooking {
    fn new(matched: usize, run: BookingRun) -> Self {
        Self {
            matched,
            run,
            persisted: false,
            emitted: 0,
            abandon: false,
        }
    }
}

impl<M: Marketplace> WorkerLoop<M> {
    pub(crate) fn new(shared: Arc<Shared<M>>, task_id: TaskId, generation: u64, cancel: CancelSignal) -> Self {
        let interval = shared.config.default_interval();
        Self {
            shared,
            task_id,
            generation,
            cancel,
            interval,
            seen: HashSet::new(),
            pending: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(task_id = %self.task_id, generation = self.generation, "worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let started_at = self.shared.clock.now();
            let outcome = self.cycle().await;
            let finished_at = self.shared.clock.now();
            debug!(task_id = %self.task_id, ?outcome, "cycle finished");

            let is_final = outcome.is_final();
            let pause = if outcome.needs_rerun() {
                self.shared.config.persistence_retry()
            } else {
                self.interval
            };
            self.shared.record_cycle(
                CycleReport {
                    task_id: self.task_id,
                    started_at,
                    finished_at,
                    outcome,
                },
                self.interval,
            );

            if is_final || !self.cancel.sleep(pause).await {
                break;
            }
        }
        self.shared.worker_exited(self.task_id, self.generation);
        info!(task_id = %self.task_id, generation = self.generation, "worker stopped");
    }

    async fn cycle(&mut self) -> CycleOutcome {
        let task = match self.shared.store.get_task(self.task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound { .. }) => {
                info!(task_id = %self.task_id, "task no longer exists, stopping worker");
                return CycleOutcome::Cancelled;
            }
            Err(e) => return persistence_failed(self.task_id, e),
        };
        if task.status != TaskStatus::Active {
            debug!(task_id = %task.id, status = %task.status, "task is not active, stopping worker");
            return CycleOutcome::Cancelled;
        }
        self.interval = task.interval(self.shared.config.default_interval());

        if let Some(pending) = self.pending.take() {
            debug!(task_id = %task.id, "resuming bookkeeping of the previous booking run");
            return self.settle_booking(&task, pending).await;
        }

        let criteria = match task.criteria() {
            Ok(criteria) => criteria,
            Err(e) => {
                return self
                    .finish(&task, Trigger::Fault {
                        kind: ErrorKind::MarketplaceRejected,
                        reason: format!("invalid search criteria: {e}"),
                    })
                    .await;
            }
        };
        if criteria.is_expired(self.shared.clock.today()) {
            return self
                .finish(&task, Trigger::Complete {
                    reason: "date window has passed".into(),
                })
                .await;
        }

        let Some(account_id) = task.linked_account else {
            return self.skip_without_account(&task).await;
        };
        let account = match self.shared.store.get_account(account_id).await {
            Ok(account) => account,
            Err(StoreError::NotFound { .. }) => {
                return self
                    .finish(&task, Trigger::Fault {
                        kind: ErrorKind::AuthInvalid,
                        reason: "linked account not found".into(),
                    })
                    .await;
            }
            Err(e) => return persistence_failed(task.id, e),
        };
        if !account.is_active {
            return self
                .finish(&task, Trigger::Fault {
                    kind: ErrorKind::AuthInvalid,
                    reason: "linked account is deactivated".into(),
                })
                .await;
        }

        self.with_account(&task, &criteria, &account).await
    }

    async fn with_account(&mut self, task: &Task, criteria: &SearchCriteria, account: &Account) -> CycleOutcome {
        let marketplace = Arc::clone(&self.shared.marketplace);
        let mut session = match marketplace.authenticate(account, &self.cancel).await {
            Ok(session) => session,
            Err(e) => return self.marketplace_failure(task, e).await,
        };
        let outcome = self.search_and_book(task, criteria, &mut session).await;
        marketplace.release(session).await;
        outcome
    }

    async fn search_and_book(
        &mut self,
        task: &Task,
        criteria: &SearchCriteria,
        session: &mut M::Session,
    ) -> CycleOutcome {
        let slots = match self.shared.marketplace.search(session, criteria, &self.cancel).await {
            Ok(slots) => slots,
            Err(e) => return self.marketplace_failure(task, e).await,
        };
        // 呼び出し中のキャンセルは、呼び出しが終わってから効く
        if self.cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let matched = matcher::filter(&slots, criteria);
        debug!(task_id = %task.id, scraped = slots.len(), matched = matched.len(), "search done");
        if matched.is_empty() {
            return match self.persist_progress(task, 0).await {
                Ok(()) => CycleOutcome::NoMatches,
                Err(e) => persistence_failed(task.id, e),
            };
        }

        if !task.auto_book {
            return self.report_matches(task, &matched.iter().map(|s| s.key()).collect::<Vec<_>>()).await;
        }

        let run = self
            .shared
            .booking
            .book_best(task.id, session, &matched, &self.cancel)
            .await;
        self.settle_booking(task, PendingBooking::new(matched.len(), run)).await
    }

    /// auto_book = false: count and announce matches not seen before.
    async fn report_matches(&mut self, task: &Task, keys: &[SlotKey]) -> CycleOutcome {
        let fresh: Vec<&SlotKey> = keys.iter().filter(|k| !self.seen.contains(*k)).collect();
        let new = fresh.len();
        if let Err(e) = self.persist_progress(task, new as u32).await {
            return persistence_failed(task.id, e);
        }
        if new > 0 {
            let event = self.event(
                task,
                Severity::Success,
                EventKind::SlotsFound { count: new },
                format!("task \"{}\": {new} new matching slot(s) at {}", task.name, task.warehouse),
            );
            if let Err(e) = self.shared.emit(event).await {
                return persistence_failed(task.id, e);
            }
        }
        self.seen.extend(keys.iter().cloned());
        CycleOutcome::Matched {
            count: keys.len(),
            new,
        }
    }

    /// Persist, announce and classify a booking run. A run that could not be
    /// fully recorded is kept and finished by the next cycle.
    async fn settle_booking(&mut self, task: &Task, mut pending: PendingBooking) -> CycleOutcome {
        let outcome = self.record_booking(task, &mut pending).await;
        if outcome.needs_rerun() && !pending.abandon {
            self.pending = Some(pending);
        }
        outcome
    }

    async fn record_booking(&self, task: &Task, pending: &mut PendingBooking) -> CycleOutcome {
        let run = &pending.run;
        if !pending.persisted {
            let found = run.taken.len() + usize::from(run.booked.is_some());
            if let Err(e) = self.persist_progress(task, found as u32).await {
                return persistence_failed(task.id, e);
            }
            pending.persisted = true;
        }

        for event in self.booking_events(task, run).into_iter().skip(pending.emitted) {
            if let Err(e) = self.shared.emit(event).await {
                return persistence_failed(task.id, e);
            }
            pending.emitted += 1;
        }

        match &run.failure {
            Some(BookingError::Failed { source, .. }) => {
                return CycleOutcome::BookingFailed {
                    reason: source.to_string(),
                };
            }
            Some(BookingError::Auth(e)) | Some(BookingError::RateLimited(e)) => {
                return self.marketplace_failure(task, e.clone()).await;
            }
            Some(BookingError::Cancelled) => return CycleOutcome::Cancelled,
            Some(BookingError::Store(e)) => {
                pending.abandon = true;
                return persistence_failed(task.id, e.clone());
            }
            None => {}
        }

        if let Some(receipt) = &run.booked {
            if self.shared.config.complete_on_booking {
                return self
                    .finish(task, Trigger::Complete {
                        reason: "slot booked".into(),
                    })
                    .await;
            }
            return CycleOutcome::Booked {
                slot_key: receipt.slot_key.clone(),
            };
        }
        if run.attempts > 0 {
            return CycleOutcome::SlotTaken {
                attempts: run.attempts,
            };
        }
        CycleOutcome::Matched {
            count: pending.matched,
            new: 0,
        }
    }

    fn booking_events(&self, task: &Task, run: &BookingRun) -> Vec<Event> {
        let mut events = Vec::new();
        for key in &run.taken {
            events.push(self.event(
                task,
                Severity::Warning,
                EventKind::SlotTaken { slot_key: key.clone() },
                format!("task \"{}\": slot {key} was taken by another seller", task.name),
            ));
        }
        if let Some(receipt) = &run.booked {
            events.push(self.event(
                task,
                Severity::Success,
                EventKind::SlotBooked {
                    slot_key: receipt.slot_key.clone(),
                },
                format!(
                    "task \"{}\": booked {} on {} (coefficient {})",
                    task.name,
                    task.warehouse,
                    receipt.date.format("%d.%m.%Y"),
                    receipt.coefficient
                ),
            ));
        }
        if let Some(BookingError::Failed { slot_key, source }) = &run.failure {
            events.push(self.event(
                task,
                Severity::Error,
                EventKind::BookingFailed {
                    slot_key: slot_key.clone(),
                },
                format!("task \"{}\": booking of {slot_key} failed: {source}", task.name),
            ));
        }
        events
    }

    /// Classify a failure that escaped the marketplace client.
    async fn marketplace_failure(&self, task: &Task, err: MarketplaceError) -> CycleOutcome {
        match err {
            MarketplaceError::Cancelled => CycleOutcome::Cancelled,
            MarketplaceError::RateExceeded { key, waited } => {
                info!(task_id = %task.id, %key, ?waited, "no rate-limit permit, skipping cycle");
                let event = self.event(
                    task,
                    Severity::Info,
                    EventKind::CycleSkipped,
                    format!("task \"{}\": cycle skipped, rate limit for {key} reached", task.name),
                );
                if let Err(e) = self.shared.emit(event).await {
                    return persistence_failed(task.id, e);
                }
                CycleOutcome::Skipped {
                    cause: SkipCause::RateLimited,
                }
            }
            other => {
                warn!(task_id = %task.id, error = %other, kind = ?other.kind(), "cycle failed");
                self.finish(task, Trigger::Fault {
                    kind: other.kind(),
                    reason: other.to_string(),
                })
                .await
            }
        }
    }

    async fn skip_without_account(&self, task: &Task) -> CycleOutcome {
        warn!(task_id = %task.id, "task has no linked account, skipping cycle");
        if let Err(e) = self.persist_progress(task, 0).await {
            return persistence_failed(task.id, e);
        }
        let event = self.event(
            task,
            Severity::Warning,
            EventKind::CycleSkipped,
            format!("task \"{}\": no marketplace account linked, search skipped", task.name),
        );
        if let Err(e) = self.shared.emit(event).await {
            return persistence_failed(task.id, e);
        }
        CycleOutcome::Skipped {
            cause: SkipCause::NoLinkedAccount,
        }
    }

    /// Leave `active` from inside the worker (completion or fault).
    async fn finish(&self, task: &Task, trigger: Trigger) -> CycleOutcome {
        let transition = match crate::domain::transition(task.status, &trigger) {
            Ok(transition) => transition,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "worker produced an impossible transition");
                return CycleOutcome::Cancelled;
            }
        };
        if let Err(e) = self.shared.apply(task, &transition).await {
            return persistence_failed(task.id, e);
        }
        match trigger {
            Trigger::Complete { reason } => CycleOutcome::Completed { reason },
            Trigger::Fault { kind, reason } => CycleOutcome::Faulted { kind, reason },
            _ => CycleOutcome::Cancelled,
        }
    }

    /// found_slots += `found`, last_check = now. Status stays `active`.
    async fn persist_progress(&self, task: &Task, found: u32) -> Result<(), StoreError> {
        let update = StatusUpdate::status(TaskStatus::Active)
            .with_found_slots(task.found_slots.saturating_add(found))
            .with_last_check(self.shared.clock.now());
        self.shared.store.update_task_status(task.id, update).await
    }

    fn event(&self, task: &Task, severity: Severity, kind: EventKind, message: String) -> Event {
        let mut event = Event::new(severity, kind, message, self.shared.clock.now()).for_task(task.id);
        if let Some(account) = task.linked_account {
            event = event.for_account(account);
        }
        event
    }
}

fn persistence_failed(task_id: TaskId, err: StoreError) -> CycleOutcome {
    error!(%task_id, error = %err, "persistence unavailable, cycle will be retried");
    CycleOutcome::PersistenceFailed {
        reason: err.to_string(),
    }
}
