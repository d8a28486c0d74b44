//! Subcommand implementations.

pub mod audit;
pub mod keys;
pub mod mandates;
pub mod replay;

use chrono::{TimeZone, Utc};

/// Renders a millisecond timestamp for operators.
pub fn format_ts(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map_or_else(|| format!("{ts_ms} ms"), |dt| dt.to_rfc3339())
}
