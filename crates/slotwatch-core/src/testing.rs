//! Test doubles shared by the module tests.
//!
//! - ScriptedBrowser / ScriptedPage: 手で組み立てた DOM を返すブラウザ
//! - FakeMarketplace: `Marketplace` を台本どおりに演じる

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::app::marketplace::parse::ATTR_SLOT_ID;
use crate::app::marketplace::selectors;
use crate::cancel::CancelSignal;
use crate::domain::{Account, AccountId, BookingReceipt, MarketplaceError, Packaging, SearchCriteria, Slot};
use crate::ports::{BrowserDriver, BrowserError, BrowserPage, Cookie, Element, Marketplace};

/// 09:00 UTC on the given day.
pub fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
}

// ---- scripted browser ----

#[derive(Debug, Default)]
pub struct BrowserScript {
    /// Where every navigation lands instead of its target.
    pub landing: Option<String>,
    pub goto_failures: u32,
    pub goto_delay: Duration,
    pub gotos: u32,
    pub opened: u32,
    pub clicks: Vec<String>,
    /// Clicking the confirm control books the slot: every cell disappears.
    pub commit_on_confirm: bool,
    wait_failures: HashMap<String, u32>,
    visible: HashSet<String>,
    elements: HashMap<String, Vec<Element>>,
}

impl BrowserScript {
    pub fn show(&mut self, selector: impl Into<String>) {
        self.visible.insert(selector.into());
    }

    pub fn put(&mut self, selector: impl Into<String>, elements: Vec<Element>) {
        self.elements.insert(selector.into(), elements);
    }

    /// The next `n` waits for `selector` fail at the transport level.
    pub fn fail_wait(&mut self, selector: impl Into<String>, n: u32) {
        self.wait_failures.insert(selector.into(), n);
    }

    pub fn clicks_on(&self, selector: &str) -> usize {
        self.clicks.iter().filter(|c| c.as_str() == selector).count()
    }

    fn take_wait_failure(&mut self, selector: &str) -> bool {
        match self.wait_failures.get_mut(selector) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn present(&self, selector: &str) -> bool {
        self.visible.contains(selector) || self.elements.get(selector).is_some_and(|els| !els.is_empty())
    }

    fn has_slot_ref(&self, selector: &str) -> bool {
        self.elements.values().flatten().any(|el| {
            el.attr(ATTR_SLOT_ID)
                .is_some_and(|r| selectors::slot_by_ref(r) == selector)
        })
    }
}

#[derive(Clone, Default)]
pub struct ScriptedBrowser {
    script: Arc<Mutex<BrowserScript>>,
}

impl ScriptedBrowser {
    /// A supply page offering `warehouse`/`packaging` with `cells` as date slots.
    pub fn portal(warehouse: &str, packaging: Packaging, cells: Vec<Element>) -> Self {
        let browser = Self::default();
        browser.with(|s| {
            s.show(selectors::CREATE_SUPPLY[0]);
            s.show(selectors::SUPPLY_FORM[0]);
            let [by_value, _] = selectors::option(warehouse);
            s.show(by_value);
            let [by_value, _] = selectors::option(selectors::packaging_label(packaging));
            s.show(by_value);
            s.put(selectors::SLOT_CELLS[0], cells);
        });
        browser
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut BrowserScript) -> R) -> R {
        let mut script = self.script.lock().unwrap();
        f(&mut script)
    }
}

#[async_trait]
impl BrowserDriver for ScriptedBrowser {
    async fn open_page(&self, _cookies: &[Cookie]) -> Result<Box<dyn BrowserPage>, BrowserError> {
        self.with(|s| s.opened += 1);
        Ok(Box::new(ScriptedPage {
            script: Arc::clone(&self.script),
            url: String::new(),
        }))
    }
}

#[derive(Default)]
pub struct ScriptedPage {
    script: Arc<Mutex<BrowserScript>>,
    url: String,
}

impl ScriptedPage {
    fn with<R>(&self, f: impl FnOnce(&mut BrowserScript) -> R) -> R {
        let mut script = self.script.lock().unwrap();
        f(&mut script)
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        let (fail, delay, landing) = self.with(|s| {
            s.gotos += 1;
            let fail = s.goto_failures > 0;
            if fail {
                s.goto_failures -= 1;
            }
            (fail, s.goto_delay, s.landing.clone())
        });
        if fail {
            return Err(BrowserError::Navigation("connection reset".into()));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.url = landing.unwrap_or_else(|| url.to_string());
        Ok(())
    }

    fn current_url(&self) -> String {
        self.url.clone()
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<bool, BrowserError> {
        self.with(|s| {
            if s.take_wait_failure(selector) {
                return Err(BrowserError::Navigation("connection reset".into()));
            }
            Ok(s.present(selector))
        })
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.with(|s| {
            if s.present(selector) || s.has_slot_ref(selector) {
                s.clicks.push(selector.to_string());
                if s.commit_on_confirm && selector == selectors::CONFIRM_BOOKING[0] {
                    s.elements.remove(selectors::SLOT_CELLS[0]);
                }
                Ok(())
            } else {
                Err(BrowserError::NotFound(selector.to_string()))
            }
        })
    }

    async fn query_all(&mut self, selector: &str) -> Result<Vec<Element>, BrowserError> {
        Ok(self.with(|s| s.elements.get(selector).cloned().unwrap_or_default()))
    }

    async fn close(&mut self) {}
}

// ---- fake marketplace ----

#[derive(Debug)]
pub struct FakeSession {
    pub account: AccountId,
}

impl FakeSession {
    pub fn new(account: AccountId) -> Self {
        Self { account }
    }
}

#[derive(Default)]
struct Script {
    slots: Vec<Slot>,
    searches: VecDeque<Result<Vec<Slot>, MarketplaceError>>,
    books: VecDeque<Result<(), MarketplaceError>>,
    auth_failure: Option<MarketplaceError>,
    search_delay: Duration,
}

#[derive(Default)]
pub struct FakeMarketplace {
    script: Mutex<Script>,
    auth_calls: AtomicUsize,
    search_calls: AtomicUsize,
    book_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Result of every search without a queued one.
    pub fn set_slots(&self, slots: Vec<Slot>) {
        self.script().slots = slots;
    }

    pub fn push_search(&self, result: Result<Vec<Slot>, MarketplaceError>) {
        self.script().searches.push_back(result);
    }

    /// Every authentication fails with `err` from now on.
    pub fn fail_auth(&self, err: MarketplaceError) {
        self.script().auth_failure = Some(err);
    }

    /// Queued booking results; bookings succeed once the queue is empty.
    pub fn push_book(&self, result: Result<(), MarketplaceError>) {
        self.script().books.push_back(result);
    }

    pub fn set_search_delay(&self, delay: Duration) {
        self.script().search_delay = delay;
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn book_calls(&self) -> usize {
        self.book_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_searches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Marketplace for FakeMarketplace {
    type Session = FakeSession;

    async fn authenticate(&self, account: &Account, _cancel: &CancelSignal) -> Result<FakeSession, MarketplaceError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        match self.script().auth_failure.clone() {
            Some(err) => Err(err),
            None => Ok(FakeSession::new(account.id)),
        }
    }

    async fn search(
        &self,
        _session: &mut FakeSession,
        _criteria: &SearchCriteria,
        _cancel: &CancelSignal,
    ) -> Result<Vec<Slot>, MarketplaceError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (delay, result) = {
            let mut script = self.script();
            let result = script
                .searches
                .pop_front()
                .unwrap_or_else(|| Ok(script.slots.clone()));
            (script.search_delay, result)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn book(
        &self,
        _session: &mut FakeSession,
        slot: &Slot,
        _cancel: &CancelSignal,
    ) -> Result<BookingReceipt, MarketplaceError> {
        self.book_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script().books.pop_front().unwrap_or(Ok(()));
        scripted.map(|()| BookingReceipt {
            slot_key: slot.key(),
            date: slot.date,
            coefficient: slot.coefficient,
            confirmation: Some("fake".into()),
            booked_at: Utc::now(),
        })
    }

    async fn release(&self, _session: FakeSession) {}
}
