//! Time and timestamp utilities

use chrono::{DateTime, Duration, Utc};

/// Get the current UTC time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Next timestamp for a partition whose last record was written at `previous`
///
/// Wall clocks can stall or step backwards; the log still needs strictly
/// increasing `created_at` values within a partition, so the result is
/// bumped one microsecond past `previous` when the clock has not moved.
pub fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let current = now();
    match previous {
        Some(prev) if current <= prev => prev + Duration::microseconds(1),
        _ => current,
    }
}
