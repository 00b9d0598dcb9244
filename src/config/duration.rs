//! Serde support for human-readable durations in pipeline files.
//!
//! Accepts `"250ms"`, `"1s"`, `"1.5s"`, `"2m"`, `"1h"` or a bare number of
//! seconds. Serializes back to whole milliseconds (`"1500ms"`).

use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => seconds(secs).map_err(de::Error::custom),
        Raw::Text(text) => parse_duration(&text).map_err(de::Error::custom),
    }
}

/// Parses a duration like `500ms`, `1.5s`, `2m` or `1h`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", text))?;
    let scale = match unit.trim() {
        "ms" => 0.001,
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, text)),
    };
    seconds(value * scale)
}

fn seconds(secs: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {}s: {}", secs, e))
}
