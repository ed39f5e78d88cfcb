//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text with microsecond
//! precision (`2024-01-02T03:04:05.000006Z`) so that text comparison in SQL
//! matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

use super::StoreError;

/// Encode a timestamp for storage.
#[inline]
pub fn encode(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
pub fn decode(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

/// Truncate to the stored precision.
#[inline]
pub fn truncate(dt: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::DurationRound;
    dt.duration_trunc(chrono::TimeDelta::microseconds(1))
        .unwrap_or(dt)
}
