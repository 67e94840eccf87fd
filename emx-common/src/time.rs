//! Timestamp utilities
//!
//! Completion timestamps are persisted as integer microseconds so that SQL
//! ordering matches chronological ordering exactly.

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Timestamp to microseconds since the Unix epoch
pub fn to_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Microseconds since the Unix epoch back to a timestamp
///
/// Out-of-range values clamp to the epoch rather than failing; they can only
/// come from a hand-edited database.
pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Milliseconds elapsed between two timestamps, zero if `end` precedes `start`
pub fn elapsed_ms(start: &DateTime<Utc>, end: &DateTime<Utc>) -> u64 {
    (*end - *start).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01
    }

    #[test]
    fn test_millis_to_duration() {
        assert_eq!(millis_to_duration(0), Duration::ZERO);
        assert_eq!(millis_to_duration(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_micros_preserve_ordering_and_value() {
        let a = from_micros(to_micros(&now()));
        let b = a + ChronoDuration::microseconds(1);
        assert!(to_micros(&a) < to_micros(&b));
        assert_eq!(from_micros(to_micros(&b)), b);
    }

    #[test]
    fn test_elapsed_ms_never_negative() {
        let start = now();
        let end = start + ChronoDuration::milliseconds(250);
        assert_eq!(elapsed_ms(&start, &end), 250);
        assert_eq!(elapsed_ms(&end, &start), 0);
    }
}
