/*!
 * Serde helpers for durations stored as whole seconds.
 *
 * Templates and delays carry `chrono::Duration` values, which have no serde
 * representation of their own. Authored templates frequently quote numbers,
 * so the deserializers accept either a JSON number or a numeric string.
 */

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;

fn seconds_from_value<E: serde::de::Error>(value: Value) -> Result<Option<i64>, E> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(i))
            } else if let Some(f) = n.as_f64() {
                // Sub-second precision is not meaningful for due dates
                Ok(Some(f as i64))
            } else {
                Err(E::custom(format!("Invalid duration: {n}")))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| E::custom(format!("Cannot parse '{s}' as seconds"))),
        other => Err(E::custom(format!(
            "Expected duration in seconds, found: {other}"
        ))),
    }
}

/// `#[serde(with = "duration_seconds")]` for a required `chrono::Duration`.
pub mod duration_seconds {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Duration::seconds(seconds_from_value::<D::Error>(value)?.unwrap_or(0)))
    }
}

/// `#[serde(default, with = "option_duration_seconds")]` for an optional duration.
pub mod option_duration_seconds {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&d.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null);
        Ok(seconds_from_value::<D::Error>(value)?.map(Duration::seconds))
    }
}
