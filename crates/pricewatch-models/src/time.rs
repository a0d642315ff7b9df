//! Timestamp helpers.
//!
//! Every timestamp in the job payload uses `YYYY-MM-DD HH:MM:SS` in local time,
//! so values are kept as second-precision [`NaiveDateTime`].

use chrono::{Local, NaiveDateTime, Timelike};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Serde adapter for `Option<NaiveDateTime>` fields.
///
/// Absent values are skipped by the owning struct; an empty string decodes to `None`.
pub mod optional_datetime {
    use super::DATETIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_str(&value.format(DATETIME_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
                .map(Some)
                .map_err(D::Error::custom),
        }
    }
}
