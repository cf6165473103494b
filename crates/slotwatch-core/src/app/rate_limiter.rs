//! RateLimiter - アカウント単位 / グローバルのリクエスト制限
//!
//! スライディングログ方式: キーごとに「ウィンドウ内で許可した時刻」を保持する。
//! どの長さ `window` の区間を取っても許可数が `max_requests` を超えない。
//!
//! ロックは std Mutex で、await をまたいで保持しない。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::cancel::CancelSignal;
use crate::config::RateLimitConfig;
use crate::domain::AccountId;
use crate::ports::RateSaturation;

/// What a key is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_requests: usize,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKey {
    Global,
    Account(AccountId),
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateKey::Global => f.write_str("global"),
            RateKey::Account(id) => id.fmt(f),
        }
    }
}

/// Proof that one request may be issued.
#[derive(Debug)]
pub struct RatePermit {
    key: RateKey,
    granted_at: Instant,
}

impl RatePermit {
    pub fn key(&self) -> RateKey {
        self.key
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("no permit for {key} within {waited:?}")]
    Exceeded { key: RateKey, waited: Duration },

    #[error("cancelled while waiting for a permit")]
    Cancelled,
}

pub struct RateLimiter {
    per_account: RatePolicy,
    global: Option<RatePolicy>,
    windows: Mutex<HashMap<RateKey, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(per_account: RatePolicy) -> Self {
        Self {
            per_account,
            global: None,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_global(mut self, global: RatePolicy) -> Self {
        self.global = Some(global);
        self
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let limiter = Self::new(RatePolicy {
            max_requests: config.max_requests,
            window: config.window(),
        });
        match config.global_max_requests {
            Some(max_requests) => limiter.with_global(RatePolicy {
                max_requests,
                window: config.window(),
            }),
            None => limiter,
        }
    }

    /// `None` = the key is not limited at all.
    fn policy(&self, key: RateKey) -> Option<RatePolicy> {
        match key {
            RateKey::Global => self.global,
            RateKey::Account(_) => Some(self.per_account),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RateKey, VecDeque<Instant>>> {
        // 中身は時刻のリストだけなので poison しても使い続けて問題ない
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Non-blocking acquisition.
    ///
    /// `Err(wait)` tells how long until the oldest request leaves the window.
    pub fn try_acquire(&self, key: RateKey) -> Result<RatePermit, Duration> {
        let now = Instant::now();
        let Some(policy) = self.policy(key) else {
            return Ok(RatePermit {
                key,
                granted_at: now,
            });
        };

        let mut windows = self.lock();
        let log = windows.entry(key).or_default();
        while let Some(&oldest) = log.front() {
            if oldest + policy.window <= now {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() < policy.max_requests {
            log.push_back(now);
            return Ok(RatePermit {
                key,
                granted_at: now,
            });
        }

        let wait = log
            .front()
            .map(|&oldest| (oldest + policy.window).saturating_duration_since(now))
            .unwrap_or(policy.window);
        Err(wait)
    }

    /// Wait for a permit, bounded by `timeout` and interruptible by `cancel`.
    pub async fn acquire(
        &self,
        key: RateKey,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<RatePermit, RateLimitError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }
            let wait = match self.try_acquire(key) {
                Ok(permit) => return Ok(permit),
                Err(wait) => wait,
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(%key, waited = ?now - started, "rate limit wait timed out");
                return Err(RateLimitError::Exceeded {
                    key,
                    waited: now - started,
                });
            }

            let nap = wait.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Current usage of every tracked key. Idle keys are dropped here.
    pub fn saturation(&self) -> Vec<RateSaturation> {
        let now = Instant::now();
        let mut windows = self.lock();
        let mut out = Vec::new();
        windows.retain(|key, log| {
            let Some(policy) = self.policy(*key) else {
                return false;
            };
            log.retain(|&t| t + policy.window > now);
            if log.is_empty() {
                return false;
            }
            out.push(RateSaturation {
                key: key.to_string(),
                in_window: log.len(),
                max: policy.max_requests,
            });
            true
        });
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use std::sync::Arc;

    fn limiter(max: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RatePolicy {
            max_requests: max,
            window: Duration::from_secs(window_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn grants_up_to_max_then_times_out() {
        let limiter = limiter(2, 60);
        let key = RateKey::Account(AccountId::generate());
        let never = CancelSignal::never();

        limiter.acquire(key, Duration::ZERO, &never).await.unwrap();
        limiter.acquire(key, Duration::ZERO, &never).await.unwrap();

        let err = limiter
            .acquire(key, Duration::from_secs(1), &never)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Exceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_window_to_free_capacity() {
        let limiter = limiter(1, 60);
        let key = RateKey::Account(AccountId::generate());
        let never = CancelSignal::never();

        let first = limiter.acquire(key, Duration::ZERO, &never).await.unwrap();
        let second = limiter
            .acquire(key, Duration::from_secs(120), &never)
            .await
            .unwrap();

        assert!(second.granted_at() - first.granted_at() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn accounts_do_not_share_budgets() {
        let limiter = limiter(1, 60);
        let a = RateKey::Account(AccountId::generate());
        let b = RateKey::Account(AccountId::generate());

        assert!(limiter.try_acquire(a).is_ok());
        assert!(limiter.try_acquire(b).is_ok());
        assert!(limiter.try_acquire(a).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn global_key_is_unlimited_unless_configured() {
        let open = limiter(1, 60);
        for _ in 0..10 {
            assert!(open.try_acquire(RateKey::Global).is_ok());
        }

        let capped = limiter(1, 60).with_global(RatePolicy {
            max_requests: 2,
            window: Duration::from_secs(60),
        });
        assert!(capped.try_acquire(RateKey::Global).is_ok());
        assert!(capped.try_acquire(RateKey::Global).is_ok());
        assert!(capped.try_acquire(RateKey::Global).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let limiter = Arc::new(limiter(1, 3600));
        let key = RateKey::Account(AccountId::generate());
        limiter.try_acquire(key).unwrap();

        let (handle, signal) = CancelHandle::new();
        let waiter = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.acquire(key, Duration::from_secs(7200), &signal).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), RateLimitError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_the_window() {
        let window = Duration::from_secs(10);
        let max = 3;
        let limiter = Arc::new(limiter(max, 10));
        let key = RateKey::Account(AccountId::generate());

        let mut joins = Vec::new();
        for _ in 0..12 {
            let limiter = Arc::clone(&limiter);
            joins.push(tokio::spawn(async move {
                limiter
                    .acquire(key, Duration::from_secs(600), &CancelSignal::never())
                    .await
                    .map(|p| p.granted_at())
            }));
        }
        let mut grants = Vec::new();
        for j in joins {
            grants.push(j.await.unwrap().unwrap());
        }
        grants.sort();

        // どの区間 [t, t + window) をとっても max 件以下
        for (i, &start) in grants.iter().enumerate() {
            let in_window = grants[i..].iter().filter(|&&t| t < start + window).count();
            assert!(in_window <= max, "window starting at #{i} had {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_reports_and_evicts_idle_keys() {
        let limiter = limiter(5, 60);
        let key = RateKey::Account(AccountId::generate());
        limiter.try_acquire(key).unwrap();
        limiter.try_acquire(key).unwrap();

        let sat = limiter.saturation();
        assert_eq!(sat.len(), 1);
        assert_eq!(sat[0].in_window, 2);
        assert_eq!(sat[0].max, 5);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.saturation().is_empty());
    }
}
