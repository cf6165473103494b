//! BookingCoordinator - マッチしたスロットを一度だけ予約する
//!
//! 二重予約ガード:
//! - プロセス内の (task, slot_key) セット
//! - 永続化コラボレータ側の記録（プロセス再起動をまたぐ）
//!
//! 試行の記録はマーケットプレイスに触る前に行う。結果がどうであれ、
//! 同じ (task, slot_key) が再び送られることはない。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::domain::{BookingReceipt, ErrorKind, MarketplaceError, Slot, SlotKey, StoreError, TaskId};
use crate::ports::{Marketplace, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyAttempted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookingOutcome {
    Booked(BookingReceipt),
    Skipped(SkipReason),
    /// Another actor won the slot.
    Taken(SlotKey),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BookingError {
    #[error("booking of {slot_key} failed: {source}")]
    Failed {
        slot_key: SlotKey,
        #[source]
        source: MarketplaceError,
    },

    #[error("session lost while booking: {0}")]
    Auth(MarketplaceError),

    #[error("rate limit hit before booking: {0}")]
    RateLimited(MarketplaceError),

    #[error("booking cancelled")]
    Cancelled,

    #[error("booking guard unavailable: {0}")]
    Store(#[from] StoreError),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::Failed { .. } => ErrorKind::BookingFailed,
            BookingError::Auth(e) | BookingError::RateLimited(e) => e.kind(),
            BookingError::Cancelled => ErrorKind::Cancelled,
            BookingError::Store(e) => e.kind(),
        }
    }
}

/// Result of working down a ranked match list.
#[derive(Debug, Default)]
pub struct BookingRun {
    pub booked: Option<BookingReceipt>,
    pub taken: Vec<SlotKey>,
    /// Matches skipped because they were attempted before.
    pub skipped: usize,
    /// Attempts that reached the marketplace.
    pub attempts: usize,
    pub failure: Option<BookingError>,
}

pub struct BookingCoordinator<M: Marketplace> {
    marketplace: Arc<M>,
    store: Arc<dyn TaskStore>,
    attempted: Mutex<HashSet<(TaskId, SlotKey)>>,
    max_attempts_per_cycle: usize,
}

impl<M: Marketplace> BookingCoordinator<M> {
    pub fn new(marketplace: Arc<M>, store: Arc<dyn TaskStore>, max_attempts_per_cycle: usize) -> Self {
        Self {
            marketplace,
            store,
            attempted: Mutex::new(HashSet::new()),
            max_attempts_per_cycle: max_attempts_per_cycle.max(1),
        }
    }

    fn attempted(&self) -> std::sync::MutexGuard<'_, HashSet<(TaskId, SlotKey)>> {
        self.attempted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `(task, key)`. `false` when someone already did.
    async fn claim(&self, task: TaskId, key: &SlotKey) -> Result<bool, StoreError> {
        if self.attempted().contains(&(task, key.clone())) {
            return Ok(false);
        }
        if self.store.has_booking_attempt(task, key).await? {
            self.attempted().insert((task, key.clone()));
            return Ok(false);
        }
        if !self.attempted().insert((task, key.clone())) {
            return Ok(false);
        }
        if let Err(e) = self.store.record_booking_attempt(task, key).await {
            // 未送信なので claim を取り消しても二重予約にはならない
            self.attempted().remove(&(task, key.clone()));
            return Err(e);
        }
        Ok(true)
    }

    /// Attempt one slot, at most once per (task, slot identity) ever.
    pub async fn book(
        &self,
        task: TaskId,
        session: &mut M::Session,
        slot: &Slot,
        cancel: &CancelSignal,
    ) -> Result<BookingOutcome, BookingError> {
        let key = slot.key();
        if !self.claim(task, &key).await? {
            debug!(%task, slot = %key, "slot already attempted, skipping");
            return Ok(BookingOutcome::Skipped(SkipReason::AlreadyAttempted));
        }

        match self.marketplace.book(session, slot, cancel).await {
            Ok(receipt) => {
                info!(%task, slot = %key, coefficient = slot.coefficient, "slot booked");
                Ok(BookingOutcome::Booked(receipt))
            }
            Err(MarketplaceError::SlotTaken(_)) => {
                warn!(%task, slot = %key, "slot taken by another seller");
                Ok(BookingOutcome::Taken(key))
            }
            Err(MarketplaceError::Cancelled) => Err(BookingError::Cancelled),
            Err(e) if e.is_auth() => Err(BookingError::Auth(e)),
            Err(e @ MarketplaceError::RateExceeded { .. }) => Err(BookingError::RateLimited(e)),
            Err(source) => Err(BookingError::Failed { slot_key: key, source }),
        }
    }

    /// Work down `ranked` (best first): stop at the first booking, at an
    /// error, or after the per-cycle attempt budget.
    pub async fn book_best(
        &self,
        task: TaskId,
        session: &mut M::Session,
        ranked: &[Slot],
        cancel: &CancelSignal,
    ) -> BookingRun {
        let mut run = BookingRun::default();
        for slot in ranked {
            if run.attempts >= self.max_attempts_per_cycle {
                debug!(%task, attempts = run.attempts, "booking budget for this cycle used up");
                break;
            }
            match self.book(task, session, slot, cancel).await {
                Ok(BookingOutcome::Booked(receipt)) => {
                    run.attempts += 1;
                    run.booked = Some(receipt);
                    break;
                }
                Ok(BookingOutcome::Taken(key)) => {
                    run.attempts += 1;
                    run.taken.push(key);
                }
                Ok(BookingOutcome::Skipped(_)) => run.skipped += 1,
                Err(e) => {
                    if matches!(e, BookingError::Failed { .. }) {
                        run.attempts += 1;
                    }
                    run.failure = Some(e);
                    break;
                }
            }
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, Packaging};
    use crate::impls::InMemoryTaskStore;
    use crate::testing::{FakeMarketplace, FakeSession};
    use chrono::NaiveDate;

    fn slot(day: u32, coef: f64) -> Slot {
        Slot::new("X", NaiveDate::from_ymd_opt(2025, 5, day).unwrap(), coef, Packaging::Boxes)
    }

    struct Harness {
        market: Arc<FakeMarketplace>,
        store: Arc<InMemoryTaskStore>,
        coordinator: BookingCoordinator<FakeMarketplace>,
        session: FakeSession,
    }

    fn harness(k: usize) -> Harness {
        let market = Arc::new(FakeMarketplace::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let coordinator = BookingCoordinator::new(market.clone(), store.clone(), k);
        Harness {
            market,
            store,
            coordinator,
            session: FakeSession::new(AccountId::generate()),
        }
    }

    #[tokio::test]
    async fn repeated_calls_reach_the_marketplace_once() {
        let mut h = harness(3);
        let task = TaskId::generate();
        let never = CancelSignal::never();
        let s = slot(10, 2.0);

        let mut real = 0;
        for _ in 0..5 {
            let outcome = h.coordinator.book(task, &mut h.session, &s, &never).await.unwrap();
            if outcome != BookingOutcome::Skipped(SkipReason::AlreadyAttempted) {
                real += 1;
            }
        }
        assert_eq!(real, 1);
        assert_eq!(h.market.book_calls(), 1);
    }

    #[tokio::test]
    async fn persisted_attempts_survive_a_fresh_coordinator() {
        let mut h = harness(3);
        let task = TaskId::generate();
        let never = CancelSignal::never();
        let s = slot(10, 2.0);
        h.market.push_book(Err(MarketplaceError::SlotTaken(s.key().to_string())));

        let first = h.coordinator.book(task, &mut h.session, &s, &never).await.unwrap();
        assert_eq!(first, BookingOutcome::Taken(s.key()));

        let restarted = BookingCoordinator::new(h.market.clone(), h.store.clone(), 3);
        let again = restarted.book(task, &mut h.session, &s, &never).await.unwrap();
        assert_eq!(again, BookingOutcome::Skipped(SkipReason::AlreadyAttempted));
        assert_eq!(h.market.book_calls(), 1);
    }

    #[tokio::test]
    async fn same_slot_for_another_task_is_independent() {
        let mut h = harness(3);
        let never = CancelSignal::never();
        let s = slot(10, 2.0);

        for _ in 0..2 {
            let outcome = h
                .coordinator
                .book(TaskId::generate(), &mut h.session, &s, &never)
                .await
                .unwrap();
            assert!(matches!(outcome, BookingOutcome::Booked(_)));
        }
    }

    #[tokio::test]
    async fn next_best_is_bounded_by_budget() {
        let mut h = harness(2);
        let task = TaskId::generate();
        let ranked = vec![slot(1, 3.0), slot(2, 2.0), slot(3, 1.5)];
        for s in &ranked {
            h.market.push_book(Err(MarketplaceError::SlotTaken(s.key().to_string())));
        }

        let run = h
            .coordinator
            .book_best(task, &mut h.session, &ranked, &CancelSignal::never())
            .await;

        assert!(run.booked.is_none());
        assert_eq!(run.taken, vec![ranked[0].key(), ranked[1].key()]);
        assert_eq!(run.attempts, 2);
        assert_eq!(h.market.book_calls(), 2);
    }

    #[tokio::test]
    async fn next_best_books_after_a_lost_race() {
        let mut h = harness(3);
        let task = TaskId::generate();
        let ranked = vec![slot(1, 3.0), slot(2, 2.0)];
        h.market.push_book(Err(MarketplaceError::SlotTaken(ranked[0].key().to_string())));

        let run = h
            .coordinator
            .book_best(task, &mut h.session, &ranked, &CancelSignal::never())
            .await;

        assert_eq!(run.booked.map(|r| r.slot_key), Some(ranked[1].key()));
        assert_eq!(run.taken.len(), 1);
    }

    #[tokio::test]
    async fn unexpected_failure_stops_the_run() {
        let mut h = harness(3);
        let task = TaskId::generate();
        let ranked = vec![slot(1, 3.0), slot(2, 2.0)];
        h.market.push_book(Err(MarketplaceError::Rejected("form error".into())));

        let run = h
            .coordinator
            .book_best(task, &mut h.session, &ranked, &CancelSignal::never())
            .await;

        let failure = run.failure.unwrap();
        assert_eq!(failure.kind(), ErrorKind::BookingFailed);
        assert_eq!(h.market.book_calls(), 1);
    }

    #[tokio::test]
    async fn guard_unavailable_means_no_marketplace_call() {
        let mut h = harness(3);
        h.store.set_unavailable(true);

        let err = h
            .coordinator
            .book(TaskId::generate(), &mut h.session, &slot(1, 2.0), &CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert_eq!(h.market.book_calls(), 0);
    }
}
