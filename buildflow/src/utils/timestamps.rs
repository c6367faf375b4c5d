//! Timestamp helpers.

use chrono::{DateTime, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Formats a timestamp as an ISO 8601 string with microsecond precision.
#[must_use]
pub fn format_iso8601(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Milliseconds elapsed between two timestamps, clamped at zero.
#[must_use]
pub fn elapsed_ms(start: &Timestamp, end: &Timestamp) -> u64 {
    u64::try_from((*end - *start).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_iso8601() {
        let dt = Utc.with_ymd_and_hms(2023, 10, 5, 14, 30, 0).unwrap();
        assert_eq!(format_iso8601(&dt), "2023-10-05T14:30:00.000000+00:00");
    }

    #[test]
    fn test_elapsed_ms_clamped() {
        let a = Utc.with_ymd_and_hms(2023, 10, 5, 14, 30, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2023, 10, 5, 14, 30, 2).unwrap();
        assert_eq!(elapsed_ms(&a, &b), 2_000);
        assert_eq!(elapsed_ms(&b, &a), 0);
    }
}
