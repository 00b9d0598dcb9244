//! Response validation against a declared [`JsonSchema`].
//!
//! Validation walks the whole value and collects every violation instead of
//! stopping at the first one, so a rejected response can be logged with the
//! full list of problems.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use super::{JsonSchema, Property};

/// Category of a single schema violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A required key is absent.
    MissingRequired,
    /// The value does not have the declared type.
    InvalidType,
    /// The value is not one of the declared enum members.
    NotInEnum,
    /// A key not declared in `properties` while additional properties are
    /// not allowed.
    UnknownField,
    /// The schema declares a type this validator does not understand.
    UnsupportedType,
}

/// A single schema violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field (`tags[1]` for array elements).
    pub field: String,
    /// Violation category.
    pub kind: ViolationKind,
    /// Human readable description.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A response that failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("response does not match schema: {}", .messages.join("; "))]
pub struct ValidationError {
    /// One message per violation, in discovery order.
    pub messages: Vec<String>,
    /// Structured violations, parallel to `messages`.
    pub violations: Vec<Violation>,
}

#[derive(Default)]
struct ValidationReport {
    violations: Vec<Violation>,
}

impl ValidationReport {
    fn add(&mut self, field: &str, kind: ViolationKind, message: String) {
        self.violations.push(Violation {
            field: field.to_string(),
            kind,
            message,
        });
    }

    fn into_result(self) -> Result<(), ValidationError> {
        if self.violations.is_empty() {
            return Ok(());
        }
        Err(ValidationError {
            messages: self.violations.iter().map(|v| v.message.clone()).collect(),
            violations: self.violations,
        })
    }
}

/// Validates `value` against `schema`, collecting all violations.
///
/// # Arguments
///
/// * `schema` - The declared response schema
/// * `value` - The parsed response
///
/// # Returns
///
/// `Ok(())` when the value conforms, otherwise a [`ValidationError`] listing
/// every violation found.
pub fn validate(schema: &JsonSchema, value: &Value) -> Result<(), ValidationError> {
    let mut report = ValidationReport::default();
    check_value(&schema.as_property(), value, "", &mut report);
    report.into_result()
}

/// Parses `text` as JSON and validates it. Unparseable text is reported as a
/// single type violation on the root.
pub fn validate_text(schema: &JsonSchema, text: &str) -> Result<Value, ValidationError> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        let message = format!("response is not valid JSON: {}", e);
        ValidationError {
            messages: vec![message.clone()],
            violations: vec![Violation {
                field: String::new(),
                kind: ViolationKind::InvalidType,
                message,
            }],
        }
    })?;
    validate(schema, &value)?;
    Ok(value)
}

fn check_value(property: &Property, value: &Value, path: &str, report: &mut ValidationReport) {
    if !property.enum_values.is_empty()
        && !property.enum_values.iter().any(|member| values_equal(member, value))
    {
        report.add(
            path,
            ViolationKind::NotInEnum,
            format!(
                "invalid value for field '{}': {} is not one of {}",
                label(path),
                value,
                Value::Array(property.enum_values.clone())
            ),
        );
    }

    let Some(expected) = property.property_type.as_deref() else {
        return;
    };

    let matches = match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_f64().is_some_and(|n| n.fract() == 0.0),
        "boolean" => value.is_boolean(),
        "array" => match value.as_array() {
            Some(elements) => {
                if let Some(items) = &property.items {
                    for (i, element) in elements.iter().enumerate() {
                        check_value(items, element, &format!("{}[{}]", path, i), report);
                    }
                }
                true
            }
            None => false,
        },
        "object" => match value.as_object() {
            Some(object) => {
                check_object(property, object, path, report);
                true
            }
            None => false,
        },
        other => {
            report.add(
                path,
                ViolationKind::UnsupportedType,
                format!("unsupported type '{}' for field '{}'", other, label(path)),
            );
            return;
        }
    };

    if !matches {
        report.add(
            path,
            ViolationKind::InvalidType,
            format!(
                "invalid type for field '{}': expected {}, got {}",
                label(path),
                expected,
                type_name(value)
            ),
        );
    }
}

fn check_object(
    property: &Property,
    object: &Map<String, Value>,
    path: &str,
    report: &mut ValidationReport,
) {
    for name in &property.required {
        if !object.contains_key(name) {
            let field = join(path, name);
            report.add(
                &field,
                ViolationKind::MissingRequired,
                format!("missing required field '{}'", field),
            );
        }
    }

    for (name, child) in &property.properties {
        if let Some(value) = object.get(name) {
            check_value(child, value, &join(path, name), report);
        }
    }

    let has_definition = !property.properties.is_empty() || !property.required.is_empty();
    if !has_definition || property.additional_properties == Some(true) {
        return;
    }

    for key in object.keys() {
        if property.properties.contains_key(key) {
            continue;
        }
        // A schema that only lists required names accepts exactly those keys.
        if property.properties.is_empty() && property.required.contains(key) {
            continue;
        }
        let field = join(path, key);
        report.add(
            &field,
            ViolationKind::UnknownField,
            format!("unknown field '{}'", field),
        );
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn label(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}
