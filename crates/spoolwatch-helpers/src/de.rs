use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Config durations are written either as integer seconds (`30`) or as
/// humantime text (`"30s"`, `"90d"`, `"250ms"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Option<Duration>, humantime::DurationError> {
        match self {
            Self::Seconds(secs) => Ok(Some(Duration::from_secs(secs))),
            Self::Text(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Ok(None);
                }
                humantime::parse_duration(value).map(Some)
            }
        }
    }
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(D::Error::custom)?
        .ok_or_else(|| D::Error::custom("duration must not be empty"))
}

pub fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => raw.into_duration().map_err(D::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "deserialize_duration")]
        interval: Duration,
        #[serde(default, deserialize_with = "deserialize_optional_duration")]
        horizon: Option<Duration>,
    }

    #[test]
    fn accepts_seconds_and_humantime_text() {
        let sample: Sample =
            serde_yaml::from_str("interval: 5\nhorizon: 90d\n").unwrap();
        assert_eq!(sample.interval, Duration::from_secs(5));
        assert_eq!(sample.horizon, Some(Duration::from_secs(90 * 86_400)));

        let sample: Sample =
            serde_yaml::from_str("interval: 250ms\nhorizon: ''\n").unwrap();
        assert_eq!(sample.interval, Duration::from_millis(250));
        assert_eq!(sample.horizon, None);
    }

    #[test]
    fn rejects_garbage_text() {
        assert!(serde_yaml::from_str::<Sample>("interval: soon\n").is_err());
        assert!(serde_yaml::from_str::<Sample>("interval: ''\n").is_err());
    }
}
