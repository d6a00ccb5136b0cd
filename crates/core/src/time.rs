//! Timestamp helpers.
//!
//! All persisted timestamps are UTC with microsecond precision so that a value
//! written to disk and read back compares equal to the in-memory original.

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};

/// Current time truncated to microseconds.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Truncate a timestamp to microsecond precision.
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(ts)
}

/// RFC 3339 rendering with a fixed microsecond fraction and a `Z` suffix.
///
/// Fixed width keeps lexical and chronological order identical, which the
/// SQLite registry relies on for `finished_at` range scans.
pub fn format(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_is_fixed_width() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(format(ts), "2026-03-01T12:00:00.000000Z");
    }

    #[test]
    fn now_has_no_sub_microsecond_component() {
        let ts = now();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }
}
