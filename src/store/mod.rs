//! Generated records and their JSONL persistence.
//!
//! Every accepted iteration of a generation step produces one [`Record`],
//! written as a single JSON line:
//!
//! ```text
//! {"id":"...","format":"json","prompt":"...","response":{...},"values":{"step.field":{"id":"...","value":"..."}}}
//! ```
//!
//! `values` holds the provenance of every placeholder substituted into the
//! prompt and is omitted when empty.

pub mod jsonl;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FieldPathError;
use crate::template::StepValue;
use crate::utils::field_path::{extract_by_path, stringify};
use crate::utils::json_extraction::clean_response;

pub use jsonl::{count_lines, read_line, RecordWriter};

/// Response payload of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Free-form text response.
    Text(String),
    /// Structured response parsed as JSON.
    Json(Value),
}

impl Payload {
    /// Cleans a raw model response and, when `structured`, parses it.
    pub fn from_response(raw: &str, structured: bool) -> Result<Self, serde_json::Error> {
        let cleaned = clean_response(raw);
        if structured {
            Ok(Payload::Json(serde_json::from_str(&cleaned)?))
        } else {
            Ok(Payload::Text(cleaned))
        }
    }

    pub fn format(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
        }
    }

    /// Value at `field_path` in canonical string form. Text payloads have no
    /// fields and always yield the whole text.
    pub fn value_at(&self, field_path: &str) -> Result<String, FieldPathError> {
        match self {
            Payload::Text(text) => Ok(text.clone()),
            Payload::Json(value) => extract_by_path(value, field_path),
        }
    }
}

/// One generated data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecordLine", into = "RecordLine")]
pub struct Record {
    pub id: String,
    pub prompt: String,
    pub payload: Payload,
    pub values: BTreeMap<String, StepValue>,
}

impl Record {
    /// Creates a record with a fresh random id. The prompt is trimmed.
    pub fn new(prompt: &str, payload: Payload, values: BTreeMap<String, StepValue>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.trim().to_string(),
            payload,
            values,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RecordLine {
    id: String,
    format: String,
    prompt: String,
    response: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    values: BTreeMap<String, StepValue>,
}

impl From<Record> for RecordLine {
    fn from(record: Record) -> Self {
        let format = record.payload.format().to_string();
        let response = match record.payload {
            Payload::Text(text) => Value::String(text),
            Payload::Json(value) => value,
        };
        Self {
            id: record.id,
            format,
            prompt: record.prompt,
            response,
            values: record.values,
        }
    }
}

impl TryFrom<RecordLine> for Record {
    type Error = String;

    fn try_from(line: RecordLine) -> Result<Self, Self::Error> {
        let payload = match line.format.as_str() {
            "text" => match line.response {
                Value::String(text) => Payload::Text(text),
                other => Payload::Text(stringify(&other)),
            },
            "json" => Payload::Json(line.response),
            other => return Err(format!("unknown record format '{}'", other)),
        };
        Ok(Self {
            id: line.id,
            prompt: line.prompt,
            payload,
            values: line.values,
        })
    }
}
