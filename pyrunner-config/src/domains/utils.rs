//! Serde helpers shared by the config domains
//!
//! Durations are written in seconds everywhere (YAML and `PYRUNNER_*`
//! variables). Whole numbers stay integers on output; fractions such as
//! `0.5` are accepted for sub-second limits.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Whole(u64),
    Fractional(f64),
}

impl Seconds {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            Seconds::Whole(seconds) => Ok(Duration::from_secs(seconds)),
            Seconds::Fractional(seconds) => Duration::try_from_secs_f64(seconds)
                .map_err(|_| format!("invalid duration of {} seconds", seconds)),
        }
    }
}

/// Parse a seconds value from an environment variable
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    match value.parse::<u64>() {
        Ok(seconds) => Seconds::Whole(seconds),
        Err(_) => Seconds::Fractional(
            value
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number of seconds", value))?,
        ),
    }
    .into_duration()
}

struct AsSeconds<'a>(&'a Duration);

impl Serialize for AsSeconds<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.subsec_nanos() == 0 {
            serializer.serialize_u64(self.0.as_secs())
        } else {
            serializer.serialize_f64(self.0.as_secs_f64())
        }
    }
}

/// `Duration` fields written as seconds
pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        AsSeconds(duration).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Seconds::deserialize(deserializer)?
            .into_duration()
            .map_err(de::Error::custom)
    }
}

/// `Option<Duration>` fields written as seconds, absent meaning no limit
pub mod optional_duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        duration.as_ref().map(AsSeconds).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<Seconds>::deserialize(deserializer)?
            .map(Seconds::into_duration)
            .transpose()
            .map_err(de::Error::custom)
    }
}

pub fn default_enabled() -> bool {
    true
}
