//! Dotted field path resolution over JSON values.
//!
//! Paths like `user.address.city` descend one object level per segment. The
//! resolved value is turned into text with a fixed canonical form so that
//! prompt rendering and provenance records agree on how values look.

use serde_json::{Number, Value};

use crate::error::FieldPathError;

/// Returns the value at `path`, descending object levels split on `.`.
///
/// An empty path returns `value` itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Result<&'a Value, FieldPathError> {
    if path.is_empty() {
        return Ok(value);
    }

    let mut current = value;
    let mut walked = String::new();
    for segment in path.split('.') {
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(segment);

        let object = current
            .as_object()
            .ok_or_else(|| FieldPathError::NotAnObject {
                field: segment.to_string(),
                path: walked.clone(),
            })?;
        current = object.get(segment).ok_or_else(|| FieldPathError::Missing {
            field: segment.to_string(),
            path: walked.clone(),
        })?;
    }
    Ok(current)
}

/// Resolves `path` inside `value` and returns its canonical string form.
///
/// # Errors
///
/// [`FieldPathError::NotAnObject`] when a segment descends into a scalar or
/// array, [`FieldPathError::Missing`] when a key is absent.
pub fn extract_by_path(value: &Value, path: &str) -> Result<String, FieldPathError> {
    lookup_path(value, path).map(stringify)
}

/// Canonical text form of a JSON value.
///
/// - null becomes the empty string
/// - booleans become `true` / `false`
/// - integral numbers print without a fractional part
/// - other numbers use the shortest round-trip decimal
/// - arrays join their stringified elements with `", "`
/// - objects become compact JSON
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_to_string(n),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(", "),
        Value::Object(_) => value.to_string(),
    }
}

fn number_to_string(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f == 0.0 => "0".to_string(),
        Some(f) if f.is_finite() && f.fract() == 0.0 => format!("{:.0}", f),
        _ => n.to_string(),
    }
}
