//! SlotMatcher - スクレイプ結果をタスク条件で絞り込み、並べる
//!
//! 純粋関数。ネットワーク層と無関係にテストできる。
//!
//! 並び順: 日付の昇順、同じ日なら coefficient の降順（その日のベストが先頭）

use std::cmp::Ordering;

use crate::domain::{SearchCriteria, Slot};

/// Does a single slot satisfy the criteria?
pub fn matches(slot: &Slot, criteria: &SearchCriteria) -> bool {
    slot.coefficient.is_finite()
        && slot.coefficient >= criteria.min_coefficient()
        && slot.date >= criteria.date_from()
        && slot.date <= criteria.date_to()
        && slot.packaging == criteria.packaging()
        && slot.warehouse.trim().to_lowercase() == criteria.warehouse().to_lowercase()
}

fn rank(a: &Slot, b: &Slot) -> Ordering {
    a.date
        .cmp(&b.date)
        .then_with(|| b.coefficient.total_cmp(&a.coefficient))
}

/// Matching slots in booking-preference order.
///
/// Idempotent: `filter(&filter(s, c), c) == filter(s, c)`.
pub fn filter(slots: &[Slot], criteria: &SearchCriteria) -> Vec<Slot> {
    let mut matched: Vec<Slot> = slots
        .iter()
        .filter(|slot| matches(slot, criteria))
        .cloned()
        .collect();
    // stable: 完全に同順位のスロットはスクレイプ順のまま
    matched.sort_by(rank);
    matched
}

/// The slot a booking attempt should go for first.
pub fn best<'a>(slots: &'a [Slot], criteria: &SearchCriteria) -> Option<&'a Slot> {
    slots
        .iter()
        .filter(|slot| matches(slot, criteria))
        .min_by(|a, b| rank(a, b))
}
