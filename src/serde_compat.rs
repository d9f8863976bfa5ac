//! Lenient deserializers for wire fields: i64 from string or number, empty strings as absent.

use serde::{Deserialize, Deserializer};

/// Accepts `123`, `"123"` or `null` (as 0).
pub fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        Str(String),
        Num(i64),
    }
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(0),
        Some(StringOrNumber::Str(s)) if s.trim().is_empty() => Ok(0),
        Some(StringOrNumber::Str(s)) => s.trim().parse().map_err(serde::de::Error::custom),
        Some(StringOrNumber::Num(n)) => Ok(n),
    }
}

/// `null`, missing and `""` all become `None`.
pub fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<String>::deserialize(deserializer)?;
    Ok(v.filter(|s| !s.is_empty()))
}
