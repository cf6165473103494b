//! MarketplaceClient - ブラウザ経由でマーケットプレイスを操作する
//!
//! 1 回の操作（ページ操作のひと続き）ごとに:
//! 1. RateLimiter の permit を取る（global → account）
//! 2. `call_timeout` の範囲で実行する
//! 3. 一時的な失敗ならバックオフしてやり直す（`RetryPolicy`）
//!
//! 認証エラーはリトライしない。アカウントを無効化してそのまま返す。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use super::parse::{ATTR_DATE, ATTR_SLOT_ID, parse_slot};
use super::retry::RetryPolicy;
use super::selectors;
use super::session::{Session, SessionPool, cookie_domain, cookies_from_credentials};
use crate::app::rate_limiter::{RateKey, RateLimitError, RateLimiter};
use crate::cancel::CancelSignal;
use crate::config::{MarketplaceConfig, RateLimitConfig};
use crate::domain::{Account, AccountId, BookingReceipt, MarketplaceError, Packaging, SearchCriteria, Slot};
use crate::ports::{BrowserDriver, BrowserError, BrowserPage, Clock, Cookie, Element, Marketplace, RateSaturation, TaskStore};

fn transport(err: BrowserError) -> MarketplaceError {
    match err {
        BrowserError::Timeout(after) => MarketplaceError::Timeout(after),
        other => MarketplaceError::TransientNetwork(other.to_string()),
    }
}

pub struct MarketplaceClient {
    browser: Arc<dyn BrowserDriver>,
    store: Arc<dyn TaskStore>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    sessions: SessionPool,
    retry: RetryPolicy,
    config: MarketplaceConfig,
    acquire_timeout: Duration,
}

impl MarketplaceClient {
    pub fn new(
        browser: Arc<dyn BrowserDriver>,
        store: Arc<dyn TaskStore>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        config: MarketplaceConfig,
        rate_limit: &RateLimitConfig,
    ) -> Self {
        Self {
            browser,
            store,
            limiter,
            clock,
            sessions: SessionPool::new(),
            retry: RetryPolicy::from_config(&config),
            config,
            acquire_timeout: rate_limit.acquire_timeout(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    async fn take_permits(&self, account: AccountId, cancel: &CancelSignal) -> Result<(), MarketplaceError> {
        for key in [RateKey::Global, RateKey::Account(account)] {
            self.limiter
                .acquire(key, self.acquire_timeout, cancel)
                .await
                .map_err(|e| match e {
                    RateLimitError::Exceeded { key, waited } => MarketplaceError::RateExceeded {
                        key: key.to_string(),
                        waited,
                    },
                    RateLimitError::Cancelled => MarketplaceError::Cancelled,
                })?;
        }
        Ok(())
    }

    /// One rate-limited, time-bounded operation.
    ///
    /// Cancellation is honoured while waiting for permits; once the operation
    /// has started it runs until it finishes or hits `call_timeout`.
    async fn guarded<T>(
        &self,
        account: AccountId,
        cancel: &CancelSignal,
        op: impl Future<Output = Result<T, MarketplaceError>>,
    ) -> Result<T, MarketplaceError> {
        self.take_permits(account, cancel).await?;
        let limit = self.config.call_timeout();
        tokio::time::timeout(limit, op)
            .await
            .map_err(|_| MarketplaceError::Timeout(limit))?
    }

    /// `Ok(())` = try again. Otherwise the error to surface.
    async fn before_retry(
        &self,
        op: &'static str,
        account: AccountId,
        err: MarketplaceError,
        attempt: u32,
        cancel: &CancelSignal,
    ) -> Result<(), MarketplaceError> {
        if !err.is_retryable() {
            return Err(err);
        }
        if !self.retry.allows_retry(attempt) {
            warn!(op, %account, attempt, error = %err, "marketplace retry budget exhausted");
            return Err(MarketplaceError::RetryExhausted {
                attempts: attempt,
                last: err.to_string(),
            });
        }
        let delay = self.retry.jittered_delay(attempt, &mut rand::thread_rng());
        warn!(op, %account, attempt, ?delay, error = %err, "transient marketplace failure, backing off");
        if cancel.sleep(delay).await {
            Ok(())
        } else {
            Err(MarketplaceError::Cancelled)
        }
    }

    async fn deactivate(&self, account: AccountId, reason: &MarketplaceError) {
        warn!(%account, error = %reason, "deactivating marketplace account");
        if let Err(e) = self.store.mark_account_inactive(account).await {
            error!(%account, error = %e, "failed to mark account inactive");
        }
    }

    /// Post-processing shared by search and book.
    async fn settle<T>(&self, session: &mut Session, result: Result<T, MarketplaceError>) -> Result<T, MarketplaceError> {
        if let Err(err) = &result {
            match err {
                MarketplaceError::AuthExpired(_) | MarketplaceError::AuthInvalid(_) => {
                    session.mark_broken();
                    self.deactivate(session.account(), err).await;
                }
                MarketplaceError::TransientNetwork(_)
                | MarketplaceError::Timeout(_)
                | MarketplaceError::OutcomeUnknown { .. }
                | MarketplaceError::RetryExhausted { .. } => session.mark_broken(),
                _ => {}
            }
        }
        result
    }

    async fn open_session(&self, account: &Account, cancel: &CancelSignal) -> Result<Session, MarketplaceError> {
        if !account.is_active {
            return Err(MarketplaceError::AuthInvalid("account is deactivated".into()));
        }
        let cookies = cookies_from_credentials(&account.credentials, &cookie_domain(&self.config.base_url))?;

        let checkout = match self.sessions.checkout(account.id, cancel).await?.resume() {
            Ok(session) => {
                debug!(account = %account.id, "reusing cached marketplace page");
                return Ok(session);
            }
            Err(checkout) => checkout,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.guarded(account.id, cancel, self.login(&cookies)).await {
                Ok(page) => return Ok(checkout.attach(page)),
                Err(err) => self.before_retry("authenticate", account.id, err, attempt, cancel).await?,
            }
        }
    }

    async fn login(&self, cookies: &[Cookie]) -> Result<Box<dyn BrowserPage>, MarketplaceError> {
        let mut page = self.browser.open_page(cookies).await.map_err(transport)?;
        let url = self.config.supplies_url();
        if let Err(e) = page.goto(&url).await {
            page.close().await;
            return Err(transport(e));
        }
        let landed = page.current_url();
        if selectors::is_login_redirect(&landed) {
            page.close().await;
            return Err(MarketplaceError::AuthExpired(format!("redirected to {landed}")));
        }
        Ok(page)
    }

    /// Navigate to the supply form with warehouse and packaging selected.
    async fn open_supply_form(
        &self,
        page: &mut dyn BrowserPage,
        warehouse: &str,
        packaging: Packaging,
    ) -> Result<(), MarketplaceError> {
        page.goto(&self.config.supplies_url()).await.map_err(transport)?;
        let landed = page.current_url();
        if selectors::is_login_redirect(&landed) {
            return Err(MarketplaceError::AuthExpired(format!("redirected to {landed}")));
        }

        let wait = self.config.element_timeout();
        let create = first_present(page, selectors::CREATE_SUPPLY, wait)
            .await?
            .ok_or_else(|| MarketplaceError::TransientNetwork("supply page did not render".into()))?;
        page.click(create).await.map_err(transport)?;
        first_present(page, selectors::SUPPLY_FORM, wait)
            .await?
            .ok_or_else(|| MarketplaceError::TransientNetwork("supply form did not open".into()))?;

        let warehouse_option = selectors::option(warehouse);
        let choice = first_present(page, &warehouse_option, wait)
            .await?
            .ok_or_else(|| MarketplaceError::Rejected(format!("warehouse \"{warehouse}\" is not offered")))?;
        page.click(choice).await.map_err(transport)?;

        let label = selectors::packaging_label(packaging);
        let packaging_option = selectors::option(label);
        let choice = first_present(page, &packaging_option, wait)
            .await?
            .ok_or_else(|| MarketplaceError::Rejected(format!("packaging \"{label}\" is not offered")))?;
        page.click(choice).await.map_err(transport)?;
        Ok(())
    }

    async fn scrape(
        &self,
        page: &mut dyn BrowserPage,
        criteria: &SearchCriteria,
        today: NaiveDate,
    ) -> Result<Vec<Slot>, MarketplaceError> {
        self.open_supply_form(page, criteria.warehouse(), criteria.packaging())
            .await?;
        let Some((_, cells)) = slot_cells(page).await? else {
            debug!(warehouse = criteria.warehouse(), "no slot cells on the page");
            return Ok(Vec::new());
        };

        let mut slots = Vec::with_capacity(cells.len());
        for (index, cell) in cells.iter().enumerate() {
            match parse_slot(cell, index, today, criteria.warehouse(), criteria.packaging()) {
                Some(slot) => slots.push(slot),
                None => debug!(index, text = %cell.text.trim(), "skipping unreadable slot cell"),
            }
        }
        debug!(cells = cells.len(), slots = slots.len(), "scraped slot cells");
        Ok(slots)
    }

    /// Everything up to (not including) the confirm click. Safe to repeat.
    async fn prepare_booking(&self, page: &mut dyn BrowserPage, slot: &Slot) -> Result<&'static str, MarketplaceError> {
        let key = slot.key();
        self.open_supply_form(page, &slot.warehouse, slot.packaging).await?;

        let today = self.clock.today();
        let (cells_selector, cells) = slot_cells(page)
            .await?
            .ok_or_else(|| MarketplaceError::SlotTaken(key.to_string()))?;
        let index = cells
            .iter()
            .enumerate()
            .position(|(i, cell)| same_slot(cell, i, slot, today))
            .ok_or_else(|| MarketplaceError::SlotTaken(key.to_string()))?;
        page.click(&cell_selector(cells_selector, &cells[index], index))
            .await
            .map_err(transport)?;

        first_present(page, selectors::CONFIRM_BOOKING, self.config.element_timeout())
            .await?
            .ok_or_else(|| MarketplaceError::Rejected("booking control not found".into()))
    }

    /// Press the confirm control and read the portal's answer. Never repeated.
    async fn confirm_booking(
        &self,
        page: &mut dyn BrowserPage,
        slot: &Slot,
        confirm: &str,
    ) -> Result<BookingReceipt, MarketplaceError> {
        let key = slot.key();
        page.click(confirm).await.map_err(transport)?;

        let wait = self.config.element_timeout();
        let receipt = |confirmation: Option<String>| BookingReceipt {
            slot_key: key.clone(),
            date: slot.date,
            coefficient: slot.coefficient,
            confirmation,
            booked_at: self.clock.now(),
        };

        if let Some(indicator) = first_present(page, selectors::BOOKING_SUCCESS, wait).await? {
            let text = texts(page, indicator).await?;
            return Ok(receipt((!text.is_empty()).then_some(text)));
        }
        if let Some(indicator) = first_present(page, selectors::BOOKING_ERROR, wait).await? {
            let text = texts(page, indicator).await?;
            if selectors::is_taken_message(&text) {
                return Err(MarketplaceError::SlotTaken(key.to_string()));
            }
            return Err(MarketplaceError::Rejected(format!("booking refused: {text}")));
        }
        // ポータルは成功表示を出さないことがある。エラーが無ければ成功とみなす
        Ok(receipt(None))
    }
}

async fn first_present<'s, S: AsRef<str>>(
    page: &mut dyn BrowserPage,
    candidates: &'s [S],
    wait: Duration,
) -> Result<Option<&'s str>, MarketplaceError> {
    for candidate in candidates {
        if page.wait_for(candidate.as_ref(), wait).await.map_err(transport)? {
            return Ok(Some(candidate.as_ref()));
        }
    }
    Ok(None)
}

async fn slot_cells(page: &mut dyn BrowserPage) -> Result<Option<(&'static str, Vec<Element>)>, MarketplaceError> {
    for &selector in selectors::SLOT_CELLS {
        let cells = page.query_all(selector).await.map_err(transport)?;
        if !cells.is_empty() {
            return Ok(Some((selector, cells)));
        }
    }
    Ok(None)
}

async fn texts(page: &mut dyn BrowserPage, selector: &str) -> Result<String, MarketplaceError> {
    let found = page.query_all(selector).await.map_err(transport)?;
    Ok(found
        .iter()
        .map(|e| e.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" "))
}

fn same_slot(cell: &Element, index: usize, slot: &Slot, today: NaiveDate) -> bool {
    match &slot.provenance.slot_ref {
        Some(slot_ref) => cell.attr(ATTR_SLOT_ID) == Some(slot_ref.as_str()),
        None => parse_slot(cell, index, today, &slot.warehouse, slot.packaging)
            .is_some_and(|found| found.date == slot.date),
    }
}

fn cell_selector(cells_selector: &str, cell: &Element, index: usize) -> String {
    if let Some(slot_ref) = cell.attr(ATTR_SLOT_ID) {
        return selectors::slot_by_ref(slot_ref);
    }
    match cell.attr(ATTR_DATE) {
        Some(date) => format!(r#"{cells_selector}[{ATTR_DATE}="{date}"]"#),
        None => format!("{cells_selector}:nth-of-type({})", index + 1),
    }
}

#[async_trait]
impl Marketplace for MarketplaceClient {
    type Session = Session;

    async fn authenticate(&self, account: &Account, cancel: &CancelSignal) -> Result<Session, MarketplaceError> {
        let result = self.open_session(account, cancel).await;
        match &result {
            Ok(_) => {
                info!(account = %account.id, "marketplace session ready");
                if let Err(e) = self
                    .store
                    .update_account_last_login(account.id, self.clock.now())
                    .await
                {
                    warn!(account = %account.id, error = %e, "failed to record last login");
                }
            }
            Err(err) if err.is_auth() => self.deactivate(account.id, err).await,
            Err(_) => {}
        }
        result
    }

    async fn search(
        &self,
        session: &mut Session,
        criteria: &SearchCriteria,
        cancel: &CancelSignal,
    ) -> Result<Vec<Slot>, MarketplaceError> {
        let account = session.account();
        let today = self.clock.today();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.guarded(account, cancel, self.scrape(session.page(), criteria, today)).await {
                Ok(slots) => break Ok(slots),
                Err(err) => {
                    if let Err(err) = self.before_retry("search", account, err, attempt, cancel).await {
                        break Err(err);
                    }
                }
            }
        };
        self.settle(session, result).await
    }

    async fn book(
        &self,
        session: &mut Session,
        slot: &Slot,
        cancel: &CancelSignal,
    ) -> Result<BookingReceipt, MarketplaceError> {
        let account = session.account();
        let mut attempt = 0;
        let prepared = loop {
            attempt += 1;
            match self.guarded(account, cancel, self.prepare_booking(session.page(), slot)).await {
                Ok(confirm) => break Ok(confirm),
                Err(err) => {
                    if let Err(err) = self.before_retry("book", account, err, attempt, cancel).await {
                        break Err(err);
                    }
                }
            }
        };

        // confirm 以降は portal 側で確定している可能性があるのでリトライしない
        let result = match prepared {
            Ok(confirm) => {
                let limit = self.config.call_timeout();
                let unknown = |reason: String| {
                    error!(%account, slot = %slot.key(), %reason, "booking outcome unknown");
                    MarketplaceError::OutcomeUnknown {
                        slot: slot.key().to_string(),
                        reason,
                    }
                };
                match tokio::time::timeout(limit, self.confirm_booking(session.page(), slot, confirm)).await {
                    Ok(Err(err)) if err.is_retryable() => Err(unknown(err.to_string())),
                    Ok(result) => result,
                    Err(_) => Err(unknown(MarketplaceError::Timeout(limit).to_string())),
                }
            }
            Err(err) => Err(err),
        };
        if let Ok(receipt) = &result {
            info!(%account, slot = %receipt.slot_key, "slot booked");
        }
        self.settle(session, result).await
    }

    async fn release(&self, session: Session) {
        session.release().await;
    }

    fn rate_saturation(&self) -> Vec<RateSaturation> {
        self.limiter.saturation()
    }
}
