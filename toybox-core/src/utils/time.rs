// src/utils/time.rs

use chrono::{DateTime, Utc};

/// Converts a timestamp into epoch seconds.
pub fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Converts epoch seconds back into a timestamp. Out-of-range values map to
/// the Unix epoch rather than panicking.
pub fn from_epoch(epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch, 0).unwrap_or_default()
}

/// Returns the current epoch seconds.
pub fn current_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Wall-clock milliseconds, used to stamp synced writes.
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}
