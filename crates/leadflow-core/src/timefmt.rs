//! Timestamp encoding for SQLite TEXT columns.
//!
//! Always UTC with millisecond precision and a `Z` suffix, so stored values
//! compare correctly as plain strings in SQL range filters.

use chrono::{DateTime, SecondsFormat, Utc};

/// Encode a timestamp for storage.
pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode a stored timestamp. Unparseable values yield `None`.
pub fn from_db(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_lexicographic_order_matches_time_order() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert!(to_db(a) < to_db(b));
        assert_eq!(from_db(&to_db(a)), Some(a));
    }

    #[test]
    fn test_garbage_is_none() {
        assert!(from_db("yesterday").is_none());
    }
}
