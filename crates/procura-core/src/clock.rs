//! Wall-clock helpers.
//!
//! All timestamps in this crate are milliseconds since the Unix epoch in
//! `i64`. Components that need testable time take an explicit `now_ms`
//! argument; these helpers are the production entry points.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Clamps to 0 for clocks before the epoch rather than panicking.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// One hour in milliseconds.
pub const HOUR_MS: i64 = 3_600_000;

/// One day in milliseconds.
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// One week in milliseconds.
pub const WEEK_MS: i64 = 7 * DAY_MS;
