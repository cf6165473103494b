//! Scraped cell -> typed Slot.
//!
//! セルのテキストは崩れていることが多いので、読めないセルは捨てる（推測しない）。

use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;

use crate::domain::{Packaging, Slot, SlotProvenance};
use crate::ports::Element;

/// Attribute carrying the marketplace's own slot reference.
pub const ATTR_SLOT_ID: &str = "data-slot-id";
pub const ATTR_DATE: &str = "data-date";
pub const ATTR_COEFFICIENT: &str = "data-coefficient";

static DMY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})[./-](\d{1,2})[./-](\d{4})\b").unwrap());

static YMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").unwrap());

static LABELLED_COEFFICIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:коэф\w*\.?|coef\w*\.?|[x×])\s*[:=]?\s*(\d+(?:[.,]\d+)?)").unwrap()
});

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").unwrap());

static DAY_OF_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{1,2})\b").unwrap());

fn decimal(s: &str) -> Option<f64> {
    s.replace(',', ".").parse::<f64>().ok().filter(|c| c.is_finite())
}

/// Date written in the cell, relative to `today`.
///
/// Order: full dates, then relative words, then a bare day of the current month.
pub fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let text = text.trim().to_lowercase();

    if let Some(c) = YMD.captures(&text) {
        return ymd(&c[1], &c[2], &c[3]);
    }
    if let Some(c) = DMY.captures(&text) {
        return ymd(&c[3], &c[2], &c[1]);
    }

    // "послезавтра" contains "завтра"
    if text.contains("послезавтра") || text.contains("day after tomorrow") {
        return Some(today + Duration::days(2));
    }
    if text.contains("завтра") || text.contains("tomorrow") {
        return Some(today + Duration::days(1));
    }
    if text.contains("сегодня") || text.contains("today") {
        return Some(today);
    }

    let day: u32 = DAY_OF_MONTH.captures(&text)?[1].parse().ok()?;
    NaiveDate::from_ymd_opt(today.year(), today.month(), day)
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

/// Coefficient shown in the cell.
///
/// Explicit attribute first; otherwise a labelled number ("коэф. 1,5", "x2"),
/// otherwise the last number left once dates are removed from the text.
pub fn parse_coefficient(element: &Element) -> Option<f64> {
    if let Some(raw) = element.attr(ATTR_COEFFICIENT) {
        return decimal(raw.trim());
    }

    let text = element.text.to_lowercase();
    if let Some(c) = LABELLED_COEFFICIENT.captures(&text) {
        return decimal(&c[1]);
    }

    let without_dates = YMD.replace_all(&text, " ");
    let without_dates = DMY.replace_all(&without_dates, " ");
    let numbers: Vec<&str> = NUMBER.find_iter(&without_dates).map(|m| m.as_str()).collect();
    // a lone integer is the day of month, not a coefficient
    match numbers.as_slice() {
        [] => None,
        [only] if !has_date(&text) && !only.contains(['.', ',']) => None,
        [.., last] => decimal(last),
    }
}

fn has_date(text: &str) -> bool {
    YMD.is_match(text) || DMY.is_match(text)
}

/// Turn one scraped cell into a Slot for `warehouse`/`packaging`.
///
/// `None` when either the date or the coefficient cannot be read.
pub fn parse_slot(
    element: &Element,
    index: usize,
    today: NaiveDate,
    warehouse: &str,
    packaging: Packaging,
) -> Option<Slot> {
    let date = match element.attr(ATTR_DATE) {
        Some(raw) => parse_date(raw, today),
        None => parse_date(&element.text, today),
    }?;
    let coefficient = parse_coefficient(element)?;

    let provenance = SlotProvenance {
        element_index: index,
        slot_ref: element.attr(ATTR_SLOT_ID).map(str::to_string),
        raw_text: element.text.trim().to_string(),
    };
    Some(Slot::new(warehouse, date, coefficient, packaging).with_provenance(provenance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 10).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[rstest]
    #[case::dotted("12.05.2025", Some(d(2025, 5, 12)))]
    #[case::slashed("3/06/2025", Some(d(2025, 6, 3)))]
    #[case::dashed_dmy("03-06-2025", Some(d(2025, 6, 3)))]
    #[case::iso("2025-06-03", Some(d(2025, 6, 3)))]
    #[case::today_ru("Сегодня", Some(d(2025, 5, 10)))]
    #[case::tomorrow_ru("завтра, коэф. 2", Some(d(2025, 5, 11)))]
    #[case::day_after_ru("Послезавтра", Some(d(2025, 5, 12)))]
    #[case::tomorrow_en("Tomorrow", Some(d(2025, 5, 11)))]
    #[case::bare_day("17 мая", Some(d(2025, 5, 17)))]
    #[case::impossible_day("31.02.2025", None)]
    #[case::nothing("нет слотов", None)]
    fn dates(#[case] text: &str, #[case] expected: Option<NaiveDate>) {
        assert_eq!(parse_date(text, today()), expected);
    }

    #[rstest]
    #[case::attribute(Element::new("12.05.2025").with_attr(ATTR_COEFFICIENT, "1.8"), Some(1.8))]
    #[case::labelled_comma(Element::new("12.05.2025 коэф. 1,5"), Some(1.5))]
    #[case::labelled_x(Element::new("завтра x2"), Some(2.0))]
    #[case::trailing_number(Element::new("12.05.2025 3"), Some(3.0))]
    #[case::bare_day_only(Element::new("17"), None)]
    #[case::bare_day_and_decimal(Element::new("17 мая 2,5"), Some(2.5))]
    #[case::garbage_attribute(Element::new("x").with_attr(ATTR_COEFFICIENT, "n/a"), None)]
    fn coefficients(#[case] element: Element, #[case] expected: Option<f64>) {
        assert_eq!(parse_coefficient(&element), expected);
    }

    #[test]
    fn slot_keeps_provenance() {
        let el = Element::new(" 12.05.2025 коэф. 1,5 ")
            .with_attr(ATTR_SLOT_ID, "wb-991")
            .with_attr(ATTR_DATE, "2025-05-12");

        let slot = parse_slot(&el, 4, today(), "Koledino", Packaging::Boxes).unwrap();
        assert_eq!(slot.date, d(2025, 5, 12));
        assert_eq!(slot.coefficient, 1.5);
        assert_eq!(slot.provenance.element_index, 4);
        assert_eq!(slot.provenance.slot_ref.as_deref(), Some("wb-991"));
        assert_eq!(slot.provenance.raw_text, "12.05.2025 коэф. 1,5");
    }

    #[test]
    fn unreadable_cells_are_dropped() {
        let el = Element::new("Загрузка...");
        assert!(parse_slot(&el, 0, today(), "Koledino", Packaging::Boxes).is_none());
    }
}
