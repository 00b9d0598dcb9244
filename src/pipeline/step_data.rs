//! Reading placeholder values from upstream step outputs.
//!
//! Each referenced upstream step is read once per iteration: line `i` of its
//! JSONL file (wrapping around) is parsed and every referenced field path is
//! extracted from it.
//!
//! - Generation step lines are [`Record`]s. A text payload yields the whole
//!   text for any path, a JSON payload yields the value at the path. The
//!   value id is the record id.
//! - Shell step lines are arbitrary JSON objects. The value id is a
//!   name-based UUID of the value so identical values share an id.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use uuid::Uuid;

use super::step::{Step, StepKind};
use crate::error::StoreError;
use crate::store::{read_line, Record};
use crate::template::StepValue;
use crate::utils::field_path::extract_by_path;

/// Reads `field_paths` from record `index` of `upstream`.
///
/// # Returns
///
/// Field path to value, one entry per requested path.
///
/// # Errors
///
/// Returns `StoreError` if the file is missing, empty, holds a line that is
/// not valid JSON, or a requested field cannot be resolved.
pub async fn read_values(
    upstream: &Step,
    field_paths: &[String],
    index: usize,
) -> Result<BTreeMap<String, StepValue>, StoreError> {
    let path = upstream.output_path.as_path();
    let line = read_line(path, index).await?;

    match &upstream.kind {
        StepKind::Generation(_) => record_values(path, &line, field_paths, index),
        StepKind::Shell(_) => object_values(path, &line, field_paths, index),
    }
}

fn record_values(
    path: &Path,
    line: &str,
    field_paths: &[String],
    index: usize,
) -> Result<BTreeMap<String, StepValue>, StoreError> {
    let record: Record =
        serde_json::from_str(line).map_err(|e| malformed(path, index, e.to_string()))?;

    field_paths
        .iter()
        .map(|field_path| {
            let value = record
                .payload
                .value_at(field_path)
                .map_err(|e| malformed(path, index, e.to_string()))?;
            Ok((field_path.clone(), StepValue::new(record.id.clone(), value)))
        })
        .collect()
}

fn object_values(
    path: &Path,
    line: &str,
    field_paths: &[String],
    index: usize,
) -> Result<BTreeMap<String, StepValue>, StoreError> {
    let object: Value =
        serde_json::from_str(line).map_err(|e| malformed(path, index, e.to_string()))?;

    field_paths
        .iter()
        .map(|field_path| {
            let value = extract_by_path(&object, field_path)
                .map_err(|e| malformed(path, index, e.to_string()))?;
            Ok((field_path.clone(), StepValue::new(value_id(&value), value)))
        })
        .collect()
}

/// Stable id of a value read from a shell step's output.
pub fn value_id(value: &str) -> String {
    Uuid::new_v3(&Uuid::NAMESPACE_OID, value.as_bytes()).to_string()
}

fn malformed(path: &Path, line: usize, message: String) -> StoreError {
    StoreError::Malformed {
        path: path.to_path_buf(),
        line,
        message,
    }
}
