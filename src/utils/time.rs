/// Time utilities for bar bucketing
use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamps above this are taken to be milliseconds
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Current wall-clock time in unix seconds
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Start of the period containing `timestamp` (floor semantics, also below zero)
pub fn period_start(timestamp: i64, duration_seconds: i64) -> i64 {
    timestamp.div_euclid(duration_seconds) * duration_seconds
}

/// Coerce an upstream timestamp that may be in milliseconds to seconds
pub fn normalize_unix_seconds(timestamp: i64) -> i64 {
    if timestamp.abs() >= MILLIS_THRESHOLD {
        timestamp / 1000
    } else {
        timestamp
    }
}

/// RFC 3339 rendering used in persisted records
pub fn format_unix(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_start() {
        assert_eq!(period_start(59, 60), 0);
        assert_eq!(period_start(60, 60), 60);
        assert_eq!(period_start(119, 60), 60);
        assert_eq!(period_start(-1, 60), -60);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_unix_seconds(1_700_000_000), 1_700_000_000);
        assert_eq!(normalize_unix_seconds(1_700_000_000_123), 1_700_000_000);
    }

    #[test]
    fn test_format_unix() {
        assert_eq!(format_unix(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_unix(60), "1970-01-01T00:01:00Z");
    }
}
