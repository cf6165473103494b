//! SimulatedPortal - 開発用のシミュレーションブラウザ
//!
//! 本物のポータルの代わりに、サプライ作成フォームと日付セルを持つページを演じる。
//! `MarketplaceClient` からは本物と同じセレクタで操作できる。
//!
//! - (倉庫, 梱包) ごとにボードを持ち、`board_ttl` ごとに作り直す
//! - スロットが出る確率、他の出品者に取られる確率はシード付き RNG で決まる
//! - cookie が 1 つも無いページはログイン画面に飛ばされる

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::app::marketplace::parse::{ATTR_DATE, ATTR_SLOT_ID};
use crate::app::marketplace::selectors;
use crate::domain::Packaging;
use crate::ports::{BrowserDriver, BrowserError, BrowserPage, Clock, Cookie, Element};

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub base_url: String,
    /// Chance that a fresh board offers any slots at all.
    pub slot_probability: f64,
    /// Chance that a confirmed booking loses the race.
    pub taken_probability: f64,
    pub horizon_days: u64,
    pub board_ttl: Duration,
    pub latency: Duration,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            base_url: "https://seller.wildberries.ru".into(),
            slot_probability: 0.6,
            taken_probability: 0.2,
            horizon_days: 14,
            board_ttl: Duration::from_secs(60),
            latency: Duration::from_millis(150),
        }
    }
}

struct Board {
    generated_at: Instant,
    cells: Vec<Element>,
}

struct Portal {
    settings: PortalSettings,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    boards: Mutex<HashMap<(String, Packaging), Board>>,
    next_ref: AtomicU64,
}

impl Portal {
    fn roll(&self, probability: f64) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn generate(&self, today: NaiveDate) -> Vec<Element> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        if !rng.gen_bool(self.settings.slot_probability.clamp(0.0, 1.0)) {
            return Vec::new();
        }
        let count = rng.gen_range(1..=5);
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = rng.gen_range(0..=self.settings.horizon_days);
            let Some(date) = today.checked_add_days(Days::new(offset)) else {
                continue;
            };
            let tenths: u32 = rng.gen_range(5..=30);
            let coefficient = format!("{},{}", tenths / 10, tenths % 10);
            let slot_ref = format!("sim-{}", self.next_ref.fetch_add(1, Ordering::Relaxed));
            cells.push(
                Element::new(format!("{} коэф. {coefficient}", date.format("%d.%m.%Y")))
                    .with_attr(ATTR_SLOT_ID, slot_ref)
                    .with_attr(ATTR_DATE, date.format("%Y-%m-%d").to_string()),
            );
        }
        cells
    }

    /// Current cells for a board, regenerated once stale.
    fn cells(&self, warehouse: &str, packaging: Packaging) -> Vec<Element> {
        let key = (warehouse.to_lowercase(), packaging);
        {
            let boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(board) = boards.get(&key) {
                if board.generated_at.elapsed() < self.settings.board_ttl {
                    return board.cells.clone();
                }
            }
        }
        let cells = self.generate(self.clock.today());
        let mut boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        boards.insert(
            key,
            Board {
                generated_at: Instant::now(),
                cells: cells.clone(),
            },
        );
        cells
    }

    fn has_cell(&self, slot_ref: &str) -> bool {
        let boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        boards
            .values()
            .any(|b| b.cells.iter().any(|c| c.attr(ATTR_SLOT_ID) == Some(slot_ref)))
    }

    fn remove_cell(&self, slot_ref: &str) {
        let mut boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        for board in boards.values_mut() {
            board.cells.retain(|c| c.attr(ATTR_SLOT_ID) != Some(slot_ref));
        }
    }
}

/// Browser driver backed by a simulated seller portal.
#[derive(Clone)]
pub struct SimulatedPortal {
    portal: Arc<Portal>,
}

impl SimulatedPortal {
    pub fn new(seed: u64, clock: Arc<dyn Clock>) -> Self {
        Self::with_settings(seed, clock, PortalSettings::default())
    }

    pub fn with_settings(seed: u64, clock: Arc<dyn Clock>, settings: PortalSettings) -> Self {
        Self {
            portal: Arc::new(Portal {
                settings,
                clock,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                boards: Mutex::new(HashMap::new()),
                next_ref: AtomicU64::new(1),
            }),
        }
    }
}

#[async_trait]
impl BrowserDriver for SimulatedPortal {
    async fn open_page(&self, cookies: &[Cookie]) -> Result<Box<dyn BrowserPage>, BrowserError> {
        Ok(Box::new(SimulatedPage {
            portal: Arc::clone(&self.portal),
            signed_in: !cookies.is_empty(),
            url: "about:blank".into(),
            form_open: false,
            warehouse: None,
            packaging: None,
            selected: None,
            verdict: None,
            closed: false,
        }))
    }
}

struct SimulatedPage {
    portal: Arc<Portal>,
    signed_in: bool,
    url: String,
    form_open: bool,
    warehouse: Option<String>,
    packaging: Option<Packaging>,
    selected: Option<String>,
    /// Result of the last confirmed booking.
    verdict: Option<Result<(), String>>,
    closed: bool,
}

fn option_value(selector: &str) -> Option<&str> {
    selector
        .strip_prefix(r#"[data-value=""#)
        .and_then(|rest| rest.strip_suffix(r#""]"#))
}

fn slot_ref(selector: &str) -> Option<&str> {
    selector
        .strip_prefix(&format!(r#"[{ATTR_SLOT_ID}=""#))
        .and_then(|rest| rest.strip_suffix(r#""]"#))
}

fn packaging_for(label: &str) -> Option<Packaging> {
    [Packaging::Boxes, Packaging::Pallets]
        .into_iter()
        .find(|p| selectors::packaging_label(*p) == label)
}

impl SimulatedPage {
    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        Ok(())
    }

    fn visible(&self, selector: &str) -> bool {
        if selector == selectors::CREATE_SUPPLY[0] {
            return self.signed_in;
        }
        if selector == selectors::SUPPLY_FORM[0] {
            return self.form_open;
        }
        if selector == selectors::CONFIRM_BOOKING[0] {
            return self.selected.is_some();
        }
        if selector == selectors::BOOKING_SUCCESS[0] {
            return matches!(self.verdict, Some(Ok(())));
        }
        if selector == selectors::BOOKING_ERROR[0] {
            return matches!(self.verdict, Some(Err(_)));
        }
        // 倉庫名はどれでも受け付ける
        self.form_open && option_value(selector).is_some()
    }
}

#[async_trait]
impl BrowserPage for SimulatedPage {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        tokio::time::sleep(self.portal.settings.latency).await;
        self.url = if self.signed_in {
            url.to_string()
        } else {
            format!("{}/login", self.portal.settings.base_url)
        };
        self.form_open = false;
        self.warehouse = None;
        self.packaging = None;
        self.selected = None;
        self.verdict = None;
        Ok(())
    }

    fn current_url(&self) -> String {
        self.url.clone()
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<bool, BrowserError> {
        self.ensure_open()?;
        Ok(self.visible(selector))
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        if selector == selectors::CREATE_SUPPLY[0] && self.signed_in {
            self.form_open = true;
            return Ok(());
        }
        if selector == selectors::CONFIRM_BOOKING[0] {
            let Some(slot_ref) = self.selected.take() else {
                return Err(BrowserError::NotFound(selector.to_string()));
            };
            // どちらにせよセルはボードから消える
            self.portal.remove_cell(&slot_ref);
            self.verdict = Some(if self.portal.roll(self.portal.settings.taken_probability) {
                Err("Слот уже занят".into())
            } else {
                Ok(())
            });
            return Ok(());
        }
        if let Some(value) = option_value(selector).filter(|_| self.form_open) {
            match packaging_for(value) {
                Some(packaging) => self.packaging = Some(packaging),
                None => self.warehouse = Some(value.to_string()),
            }
            return Ok(());
        }
        if let Some(slot_ref) = slot_ref(selector) {
            if self.portal.has_cell(slot_ref) {
                self.selected = Some(slot_ref.to_string());
                return Ok(());
            }
        }
        Err(BrowserError::NotFound(selector.to_string()))
    }

    async fn query_all(&mut self, selector: &str) -> Result<Vec<Element>, BrowserError> {
        self.ensure_open()?;
        if selector == selectors::SLOT_CELLS[0] && self.form_open {
            if let (Some(warehouse), Some(packaging)) = (&self.warehouse, self.packaging) {
                return Ok(self.portal.cells(warehouse, packaging));
            }
        }
        let text = match (&self.verdict, selector) {
            (Some(Ok(())), s) if s == selectors::BOOKING_SUCCESS[0] => "Поставка запланирована".to_string(),
            (Some(Err(msg)), s) if s == selectors::BOOKING_ERROR[0] => msg.clone(),
            _ => return Ok(Vec::new()),
        };
        Ok(vec![Element::new(text)])
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
