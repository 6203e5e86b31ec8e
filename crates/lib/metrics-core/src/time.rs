//! Timestamp encodings used in stored records.
//!
//! Hash fields hold unix milliseconds; sorted-set scores hold unix seconds
//! with millisecond precision.

use chrono::{DateTime, Utc};

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

pub fn to_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub fn from_score(score: f64) -> Option<DateTime<Utc>> {
    if !score.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((score * 1000.0).round() as i64)
}

/// Whole and fractional seconds between two instants, clamped at zero.
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let millis = (later - earlier).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}

/// `now - age`, saturating at the earliest representable instant.
pub fn cutoff(now: DateTime<Utc>, age: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
