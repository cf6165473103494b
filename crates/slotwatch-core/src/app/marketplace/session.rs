//! Per-account session pool.
//!
//! アカウントごとに 1 つの非同期ロックを持つ。セッションを持っている間は
//! そのアカウントの他の操作は待たされる（同じアカウントで操作が交錯しない）。
//! release されたページはキャッシュされ、次のサイクルで再利用される。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::cancel::CancelSignal;
use crate::domain::{AccountId, MarketplaceError, SessionCredentials};
use crate::ports::{BrowserPage, Cookie};

type PageSlot = Arc<AsyncMutex<Option<Box<dyn BrowserPage>>>>;

#[derive(Default)]
pub struct SessionPool {
    slots: Mutex<HashMap<AccountId, PageSlot>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, account: AccountId) -> PageSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(account).or_default())
    }

    /// Take exclusive use of `account`'s browsing context.
    pub async fn checkout(&self, account: AccountId, cancel: &CancelSignal) -> Result<Checkout, MarketplaceError> {
        let slot = self.slot(account);
        let mut guard = tokio::select! {
            _ = cancel.cancelled() => return Err(MarketplaceError::Cancelled),
            guard = slot.lock_owned() => guard,
        };
        let cached = guard.take();
        Ok(Checkout {
            account,
            cached,
            guard,
        })
    }

    /// Accounts that currently have a page parked in the pool.
    pub fn cached_accounts(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|slot| slot.try_lock().map(|page| page.is_some()).unwrap_or(false))
            .count()
    }
}

/// Exclusive claim on one account, before a page is attached.
pub struct Checkout {
    account: AccountId,
    cached: Option<Box<dyn BrowserPage>>,
    guard: OwnedMutexGuard<Option<Box<dyn BrowserPage>>>,
}

impl Checkout {
    pub fn account(&self) -> AccountId {
        self.account
    }

    /// Reuse the parked page, if any.
    pub fn resume(mut self) -> Result<Session, Checkout> {
        match self.cached.take() {
            Some(page) => Ok(Session {
                account: self.account,
                page,
                guard: self.guard,
                broken: false,
            }),
            None => Err(self),
        }
    }

    pub fn attach(self, page: Box<dyn BrowserPage>) -> Session {
        Session {
            account: self.account,
            page,
            guard: self.guard,
            broken: false,
        }
    }
}

/// Authenticated browsing context leased to one in-flight operation sequence.
pub struct Session {
    account: AccountId,
    page: Box<dyn BrowserPage>,
    guard: OwnedMutexGuard<Option<Box<dyn BrowserPage>>>,
    broken: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn page(&mut self) -> &mut dyn BrowserPage {
        self.page.as_mut()
    }

    /// Do not hand this page to the next cycle.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Give the account back. Healthy pages stay parked; broken ones are closed.
    pub async fn release(self) {
        let Session {
            account,
            mut page,
            mut guard,
            broken,
        } = self;
        if broken {
            tracing::debug!(%account, "closing broken marketplace page");
            page.close().await;
        } else {
            *guard = Some(page);
        }
    }
}

/// Cookies stored as the account's credential blob (JSON array).
///
/// Missing domain/path default to the marketplace domain and `/`.
pub fn cookies_from_credentials(
    credentials: &SessionCredentials,
    default_domain: &str,
) -> Result<Vec<Cookie>, MarketplaceError> {
    if credentials.is_empty() {
        return Err(MarketplaceError::AuthInvalid("no session cookies stored".into()));
    }
    let mut cookies: Vec<Cookie> = serde_json::from_str(credentials.expose())
        .map_err(|e| MarketplaceError::AuthInvalid(format!("malformed session cookies: {e}")))?;
    if cookies.is_empty() {
        return Err(MarketplaceError::AuthInvalid("no session cookies stored".into()));
    }
    for cookie in &mut cookies {
        cookie.domain.get_or_insert_with(|| default_domain.to_string());
        cookie.path.get_or_insert_with(|| "/".to_string());
    }
    Ok(cookies)
}

/// ".example.ru" for "https://seller.example.ru/..."
pub fn cookie_domain(base_url: &str) -> String {
    let host = base_url
        .split("://")
        .nth(1)
        .unwrap_or(base_url)
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.as_slice() {
        [.., second, top] => format!(".{second}.{top}"),
        [single] => (*single).to_string(),
        [] => String::new(),
    }
}
