//! Page selectors of the seller portal's supply flow.
//!
//! 候補は上から順に試す。ポータルの DOM が変わったらここだけ直す。

use crate::domain::Packaging;

pub const CREATE_SUPPLY: &[&str] = &[
    r#"button[data-testid="create-supply-button"]"#,
    ".create-supply-btn",
];

pub const SUPPLY_FORM: &[&str] = &[r#"[role="dialog"]"#, ".modal", ".form"];

pub const SLOT_CELLS: &[&str] = &[
    r#"[data-testid*="date-slot"]"#,
    ".date-slot",
    ".slot-item",
    ".available-date",
];

pub const CONFIRM_BOOKING: &[&str] = &[
    r#"button[data-testid="book-slot-button"]"#,
    ".confirm-btn",
    ".btn-primary",
];

pub const BOOKING_SUCCESS: &[&str] = &[".success-message", ".alert-success"];

pub const BOOKING_ERROR: &[&str] = &[".error-message", ".alert-error"];

/// Error texts meaning another seller got the slot first.
const TAKEN_MARKERS: &[&str] = &["занят", "недоступ", "taken", "no longer available"];

/// Option in a picker (warehouse, packaging), by its visible value.
pub fn option(value: &str) -> [String; 2] {
    [
        format!(r#"[data-value="{value}"]"#),
        format!(r#"[title="{value}"]"#),
    ]
}

/// Label the portal uses for a packaging type.
pub fn packaging_label(packaging: Packaging) -> &'static str {
    match packaging {
        Packaging::Boxes => "Короба",
        Packaging::Pallets => "Палеты",
    }
}

pub fn slot_by_ref(slot_ref: &str) -> String {
    format!(r#"[data-slot-id="{slot_ref}"]"#)
}

pub fn is_login_redirect(url: &str) -> bool {
    let url = url.to_lowercase();
    url.contains("login") || url.contains("auth")
}

pub fn is_taken_message(text: &str) -> bool {
    let text = text.to_lowercase();
    TAKEN_MARKERS.iter().any(|m| text.contains(m))
}
