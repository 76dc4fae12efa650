/// Date and instant handling shared by every entity and backend
///
/// Storage backends disagree about how they represent time: the document store
/// keeps whatever JSON it was given, SQLite returns text, legacy NeDB files
/// carry `{"$$date": <epoch ms>}` objects and older JSON exports use epoch
/// numbers. Everything funnels through the helpers here so that a value read
/// from any backend compares equal to the value that was written.
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::domain::DomainError;

/// Canonical calendar-day format (`2024-07-03`)
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Format an instant in the canonical ISO-8601 form (`2024-07-03T11:00:00.000Z`)
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format a calendar day in the canonical form
pub fn format_day(day: &NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Today's date in UTC, the day boundary every backend uses
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Parse an instant from the textual forms the backends produce
///
/// Accepts RFC 3339, SQLite's `CURRENT_TIMESTAMP` form (`YYYY-MM-DD HH:MM:SS`),
/// naive ISO date-times (treated as UTC) and bare days (midnight UTC).
pub fn parse_instant(text: &str) -> Result<DateTime<Utc>, DomainError> {
    let trimmed = text.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(day) = NaiveDate::parse_from_str(trimmed, DAY_FORMAT) {
        if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(DomainError::InvalidDate(text.to_string()))
}

/// Interpret a JSON value as an instant
///
/// Strings are parsed with [`parse_instant`], numbers are epoch milliseconds
/// and `{"$$date": ms}` is the NeDB native date encoding.
pub fn instant_from_value(value: &Value) -> Result<DateTime<Utc>, DomainError> {
    match value {
        Value::String(text) => parse_instant(text),
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .or_else(|| number.as_f64().map(|f| f as i64))
                .ok_or_else(|| DomainError::InvalidDate(number.to_string()))?;
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| DomainError::InvalidDate(number.to_string()))
        }
        Value::Object(map) => match map.get("$$date") {
            Some(inner @ Value::Number(_)) => instant_from_value(inner),
            _ => Err(DomainError::InvalidDate(value.to_string())),
        },
        _ => Err(DomainError::InvalidDate(value.to_string())),
    }
}

/// Interpret a JSON value as a calendar day
///
/// A bare `YYYY-MM-DD` string is taken literally; anything else goes through
/// instant normalization and is truncated to its UTC day.
pub fn day_from_value(value: &Value) -> Result<NaiveDate, DomainError> {
    if let Value::String(text) = value {
        if let Ok(day) = NaiveDate::parse_from_str(text.trim(), DAY_FORMAT) {
            return Ok(day);
        }
    }
    instant_from_value(value).map(|instant| instant.date_naive())
}

/// Coerce any supported date representation to the canonical instant string
pub fn normalize_instant(value: &Value) -> Result<String, DomainError> {
    instant_from_value(value).map(|instant| format_instant(&instant))
}

/// Coerce any supported date representation to the canonical day string
pub fn normalize_day(value: &Value) -> Result<String, DomainError> {
    day_from_value(value).map(|day| format_day(&day))
}

/// Serde adapter storing instants in the canonical string form while
/// accepting every representation [`instant_from_value`] understands
pub mod instant {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_instant(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::instant_from_value(&value).map_err(serde::de::Error::custom)
    }

    /// Same as the parent module for optional fields; `null` maps to `None`
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};
        use serde_json::Value;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(instant) => serializer.serialize_str(&super::super::format_instant(instant)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<Value>::deserialize(deserializer)? {
                None | Some(Value::Null) => Ok(None),
                Some(value) => super::super::instant_from_value(&value)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

/// Serde adapter for calendar days
pub mod day {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_day(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::day_from_value(&value).map_err(serde::de::Error::custom)
    }
}
