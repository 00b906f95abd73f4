//! Serde helpers for human-readable durations (`"2m"`, `"300ms"`, `"1h 30m"`).
//!
//! Use with `#[serde(with = "common::duration")]` on `Duration` fields and
//! `#[serde(with = "common::duration::option")]` on `Option<Duration>` fields.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize a duration as a humantime string.
///
/// # Errors
///
/// Propagates serializer errors.
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

/// Deserialize a duration from a humantime string.
///
/// # Errors
///
/// Fails when the string is not a valid humantime duration.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim())
        .map_err(|e| serde::de::Error::custom(format!("invalid duration '{raw}': {e}")))
}

/// Same as the parent module, for optional fields.
pub mod option {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    /// Serialize an optional duration; `None` becomes null.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional humantime duration.
    ///
    /// # Errors
    ///
    /// Fails when a present value is not a valid humantime duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            humantime::parse_duration(s.trim())
                .map_err(|e| serde::de::Error::custom(format!("invalid duration '{s}': {e}")))
        })
        .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Timeouts {
        #[serde(with = "crate::duration")]
        apply: Duration,
        #[serde(default, with = "crate::duration::option")]
        suite: Option<Duration>,
    }

    #[test]
    fn test_parses_humantime_strings() {
        let t: Timeouts = serde_yaml::from_str("apply: 2m\nsuite: 90s\n").unwrap();
        assert_eq!(t.apply, Duration::from_secs(120));
        assert_eq!(t.suite, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_optional_field_may_be_absent() {
        let t: Timeouts = serde_yaml::from_str("apply: 300ms\n").unwrap();
        assert_eq!(t.apply, Duration::from_millis(300));
        assert_eq!(t.suite, None);
    }

    #[test]
    fn test_rejects_garbage() {
        let result: Result<Timeouts, _> = serde_yaml::from_str("apply: soon\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("invalid duration 'soon'"), "got: {err}");
    }

    #[test]
    fn test_serializes_back_to_humantime() {
        let t = Timeouts {
            apply: Duration::from_secs(120),
            suite: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"apply":"2m","suite":null}"#);
    }
}
