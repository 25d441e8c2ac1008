//! Field coercion from raw text to typed values
//!
//! Every coercer is total: unparseable or empty input becomes `None` (or
//! `false` for flags), never an error.

use chrono::{NaiveDate, NaiveTime};

/// Floating-point value; `None` for empty, unparseable or non-finite input
pub fn numeric(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn integer(text: &str) -> Option<i64> {
    text.trim().parse().ok()
}

/// Event indicator: the presence of any code means the event occurred
pub fn flag(text: &str) -> bool {
    !text.is_empty()
}

/// ISO `YYYY-MM-DD` date
pub fn iso_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

/// US `MM/DD/YYYY` date
pub fn us_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%m/%d/%Y").ok()
}

/// 24-hour `HH:MM` time; single-digit hours are left-padded to `0H:MM`
pub fn clock_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let padded = format!("{:0>5}", text);
    NaiveTime::parse_from_str(&padded, "%H:%M").ok()
}
