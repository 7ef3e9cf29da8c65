use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

#[inline]
pub fn to_millis(time: &DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

// Out-of-range values fall back to the epoch instead of failing a read of a
// bookkeeping row.
#[inline]
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Converts a duration to whole milliseconds, saturating at `i64::MAX`.
#[inline]
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
