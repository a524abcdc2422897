//! Duration (de)serialization accepting either a humantime string (`"30s"`)
//! or a plain millisecond count, mirroring the teacher's
//! `deserialize_duration`/`serialize_duration` helper pair.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

pub fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        None,
        String(String),
        U64(u64),
    }
    match Option::<Helper>::deserialize(deserializer)? {
        None | Some(Helper::None) => Ok(None),
        Some(Helper::String(s)) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        Some(Helper::U64(ms)) => Ok(Some(Duration::from_millis(ms))),
    }
}

pub fn serialize_duration_opt<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Serialize)]
    struct Wrapper {
        #[serde(
            deserialize_with = "deserialize_duration",
            serialize_with = "serialize_duration"
        )]
        d: Duration,
    }

    #[test]
    fn parses_humantime_string() {
        let w: Wrapper = serde_json::from_str(r#"{"d": "30s"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(30));
    }

    #[test]
    fn parses_millis() {
        let w: Wrapper = serde_json::from_str(r#"{"d": 1500}"#).unwrap();
        assert_eq!(w.d, Duration::from_millis(1500));
    }

    #[test]
    fn serializes_as_millis() {
        let w = Wrapper {
            d: Duration::from_secs(2),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"d":2000}"#);
    }

    #[test]
    fn rejects_garbage_string() {
        let err = serde_json::from_str::<Wrapper>(r#"{"d": "not-a-duration"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }
}
