//! Timestamps as they travel on the wire, and the file-time cursor scale.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Placeholder for a timestamp the source never provided.
pub const UNSET_TIME: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// 100ns ticks between 1601-01-01 and 1970-01-01.
const FILE_TIME_EPOCH_OFFSET: i64 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Convert a timestamp to file time (100ns ticks since 1601-01-01 UTC).
///
/// Replication cursors use this scale so they stay comparable with peers
/// that already speak the protocol.
pub fn file_time(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add((dt.timestamp_subsec_nanos() / 100) as i64)
        .saturating_add(FILE_TIME_EPOCH_OFFSET)
}

/// Inverse of [`file_time`]. Returns `None` for negative or out of range values.
pub fn from_file_time(ft: i64) -> Option<DateTime<Utc>> {
    if ft < 0 {
        return None;
    }
    let since_unix = ft - FILE_TIME_EPOCH_OFFSET;
    let secs = since_unix.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_unix.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Render a cursor for log lines.
pub(crate) fn format_file_time(ft: i64) -> String {
    match from_file_time(ft) {
        Some(dt) if ft >= 0 => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "-".to_string(),
    }
}

/// Parse a wire timestamp.
///
/// Peers send RFC 3339 with or without offset and with up to seven
/// fractional digits; values without an offset are taken as UTC.
pub(crate) fn parse_wire_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
}

/// Serde adapter for record timestamps; null, missing and unparsable become [`UNSET_TIME`].
pub(crate) mod wire_time {
    use super::*;

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .and_then(parse_wire_time)
            .unwrap_or(UNSET_TIME))
    }
}
