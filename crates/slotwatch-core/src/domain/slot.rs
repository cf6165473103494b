//! Slot - スクレイプしたスロットと予約結果
//!
//! Slot はサイクル内だけで使う一時データ。コアは永続化しない。

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::task::Packaging;

/// Where a slot came from on the page; needed to book it later in the cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlotProvenance {
    /// Position of the cell in the scraped list.
    pub element_index: usize,
    /// Marketplace-side reference, when the page exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_ref: Option<String>,
    /// Cell text as scraped.
    #[serde(default)]
    pub raw_text: String,
}

/// A marketplace-offered delivery window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub warehouse: String,
    pub date: NaiveDate,
    pub coefficient: f64,
    pub packaging: Packaging,
    #[serde(default)]
    pub provenance: SlotProvenance,
}

impl Slot {
    pub fn new(warehouse: impl Into<String>, date: NaiveDate, coefficient: f64, packaging: Packaging) -> Self {
        Self {
            warehouse: warehouse.into(),
            date,
            coefficient,
            packaging,
            provenance: SlotProvenance::default(),
        }
    }

    pub fn with_provenance(mut self, provenance: SlotProvenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Identity used by the double-booking guard.
    ///
    /// coefficient は変動するので含めない（同じ日・倉庫・梱包なら同じ枠）。
    pub fn key(&self) -> SlotKey {
        SlotKey(format!(
            "{}|{}|{}",
            self.warehouse.trim().to_lowercase(),
            self.date,
            self.packaging
        ))
    }
}

/// Stable identity of a slot across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confirmation of a successful reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingReceipt {
    pub slot_key: SlotKey,
    pub date: NaiveDate,
    pub coefficient: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
    pub booked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_coefficient_and_case() {
        let date = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();
        let a = Slot::new("Koledino", date, 1.5, Packaging::Boxes);
        let b = Slot::new(" koledino ", date, 2.0, Packaging::Boxes);
        let c = Slot::new("Koledino", date, 1.5, Packaging::Pallets);

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().as_str(), "koledino|2025-05-10|boxes");
    }
}
