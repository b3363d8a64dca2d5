//! Timestamp parsing and UTC normalisation.
//!
//! Everything stored or returned by vitalsdb is a `DateTime<Utc>`. Values that
//! arrive without an offset (older snapshots, hand-written payloads) are read
//! as UTC rather than rejected.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};

use crate::error::{Error, Result};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Which end of an inclusive range a date-only string stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    StartOfDay,
    EndOfDay,
}

/// Parse an instant, normalising to UTC. Accepts RFC 3339 and naive date-times.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse either a full instant or a bare date. A bare date is widened to the
/// start or end of that UTC day depending on `boundary`.
pub fn parse_boundary(value: &str, boundary: Boundary) -> Result<DateTime<Utc>> {
    if let Some(instant) = parse_instant(value) {
        return Ok(instant);
    }
    let day = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| Error::validation(format!("invalid date or timestamp '{}'", value)))?;
    let time = match boundary {
        Boundary::StartOfDay => NaiveTime::MIN,
        Boundary::EndOfDay => NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
            .unwrap_or(NaiveTime::MIN),
    };
    Ok(Utc.from_utc_datetime(&day.and_time(time)))
}

/// Parse a reporting day. Full timestamps are truncated to their UTC date.
pub fn parse_day(value: &str) -> Result<NaiveDate> {
    if let Ok(day) = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d") {
        return Ok(day);
    }
    parse_instant(value)
        .map(|instant| instant.date_naive())
        .ok_or_else(|| Error::validation(format!("invalid date '{}'", value)))
}

pub fn format_instant(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Serde adapter for `DateTime<Utc>` that tolerates missing offsets.
pub mod utc_datetime {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_instant(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_instant(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(value) => serializer.serialize_str(&super::super::format_instant(value)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::super::parse_instant(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw))),
                None => Ok(None),
            }
        }
    }
}
