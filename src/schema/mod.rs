//! JSON schema model for structured step responses.
//!
//! Steps may declare a `jsonSchema` describing the object the model must
//! return. Only a practical subset of JSON Schema is understood: `type`,
//! `properties`, `required`, `enum`, `items`, `additionalProperties` and
//! nesting. The descriptive keywords (`description`, `minimum`, `pattern`...)
//! are carried through to the backend untouched.
//!
//! # Example
//!
//! ```ignore
//! use stepforge::schema::{validate, JsonSchema};
//!
//! let schema: JsonSchema = serde_json::from_value(serde_json::json!({
//!     "type": "object",
//!     "properties": {"name": {"type": "string"}},
//!     "required": ["name"]
//! }))?;
//! assert!(validate(&schema, &serde_json::json!({"name": "Ada"})).is_ok());
//! ```

pub mod validator;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use validator::{validate, validate_text, ValidationError, Violation, ViolationKind};

/// Errors raised when a pipeline-declared schema is internally inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("property '{0}' is declared but not listed in 'required'")]
    NotRequired(String),

    #[error("required field '{0}' is not declared in 'properties'")]
    UndeclaredRequired(String),
}

/// Root schema of a structured response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub schema_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(
        rename = "additionalProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<bool>,
}

/// A single property node. Object properties nest further properties,
/// array properties describe their elements through `items`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Property>>,

    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl Property {
    /// Creates a property of the given JSON type.
    pub fn of_type(property_type: impl Into<String>) -> Self {
        Self {
            property_type: Some(property_type.into()),
            ..Self::default()
        }
    }

    /// Sets the enum members.
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = values;
        self
    }

    /// Sets the element schema of an array property.
    pub fn with_items(mut self, items: Property) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    /// Adds a nested property and marks it required.
    pub fn with_property(mut self, name: impl Into<String>, property: Property) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, property);
        self
    }
}

impl JsonSchema {
    /// Creates an empty object schema.
    pub fn object() -> Self {
        Self {
            schema_type: "object".to_string(),
            ..Self::default()
        }
    }

    /// Adds a property and marks it required.
    pub fn with_property(mut self, name: impl Into<String>, property: Property) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, property);
        self
    }

    /// Returns true if any property or required name is declared.
    pub fn has_definition(&self) -> bool {
        !self.properties.is_empty() || !self.required.is_empty()
    }

    /// Checks that every declared property is required and every required
    /// name is declared.
    pub fn ensure_fully_required(&self) -> Result<(), SchemaError> {
        for name in self.properties.keys() {
            if !self.required.iter().any(|r| r == name) {
                return Err(SchemaError::NotRequired(name.clone()));
            }
        }
        for name in &self.required {
            if !self.properties.contains_key(name) {
                return Err(SchemaError::UndeclaredRequired(name.clone()));
            }
        }
        Ok(())
    }

    /// Returns true if `path` (dot separated) names declared properties,
    /// descending through nested object properties.
    pub fn has_field_path(&self, path: &str) -> bool {
        let mut segments = path.split('.');
        let Some(first) = segments.next() else {
            return false;
        };
        let Some(mut current) = self.properties.get(first) else {
            return false;
        };
        for segment in segments {
            match current.properties.get(segment) {
                Some(next) => current = next,
                None => return false,
            }
        }
        true
    }

    /// Serializes the schema as 2-space indented JSON. Property order is
    /// sorted so the text is stable across runs.
    pub fn to_json_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Views the root schema as an object property node.
    pub(crate) fn as_property(&self) -> Property {
        let property_type = if self.schema_type.is_empty() {
            "object".to_string()
        } else {
            self.schema_type.clone()
        };
        Property {
            property_type: Some(property_type),
            properties: self.properties.clone(),
            required: self.required.clone(),
            additional_properties: self.additional_properties,
            ..Property::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person_schema() -> JsonSchema {
        JsonSchema::object()
            .with_property("name", Property::of_type("string"))
            .with_property(
                "address",
                Property::of_type("object").with_property("city", Property::of_type("string")),
            )
    }

    #[test]
    fn test_has_definition() {
        assert!(!JsonSchema::default().has_definition());
        assert!(!JsonSchema::object().has_definition());
        assert!(person_schema().has_definition());

        let required_only = JsonSchema {
            required: vec!["id".into()],
            ..JsonSchema::default()
        };
        assert!(required_only.has_definition());
    }

    #[test]
    fn test_ensure_fully_required() {
        assert!(person_schema().ensure_fully_required().is_ok());

        let mut schema = person_schema();
        schema.required.retain(|r| r != "name");
        assert_eq!(
            schema.ensure_fully_required(),
            Err(SchemaError::NotRequired("name".into()))
        );

        let mut schema = person_schema();
        schema.required.push("age".into());
        assert_eq!(
            schema.ensure_fully_required(),
            Err(SchemaError::UndeclaredRequired("age".into()))
        );
    }

    #[test]
    fn test_has_field_path() {
        let schema = person_schema();
        assert!(schema.has_field_path("name"));
        assert!(schema.has_field_path("address.city"));
        assert!(!schema.has_field_path("address.zip"));
        assert!(!schema.has_field_path("name.first"));
        assert!(!schema.has_field_path(""));
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
type: object
properties:
  label:
    type: string
    enum: [positive, negative]
  tags:
    type: array
    items:
      type: string
  score:
    type: number
    minimum: 0
    maximum: 1
required: [label, tags, score]
additionalProperties: false
"#;
        let schema: JsonSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(schema.schema_type, "object");
        assert_eq!(schema.properties.len(), 3);
        assert_eq!(schema.additional_properties, Some(false));
        assert_eq!(schema.properties["label"].enum_values.len(), 2);
        assert_eq!(
            schema.properties["tags"]
                .items
                .as_ref()
                .and_then(|i| i.property_type.as_deref()),
            Some("string")
        );
        assert_eq!(schema.properties["score"].maximum, Some(1.0));
    }

    #[test]
    fn test_to_json_text_is_sorted_and_indented() {
        let schema = JsonSchema::object()
            .with_property("zeta", Property::of_type("string"))
            .with_property("alpha", Property::of_type("integer"));
        let text = schema.to_json_text().unwrap();

        assert!(text.starts_with("{\n  \"type\": \"object\""));
        let alpha = text.find("\"alpha\"").unwrap();
        let zeta = text.find("\"zeta\"").unwrap();
        assert!(alpha < zeta);
        assert!(!text.contains("additionalProperties"));

        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["properties"]["alpha"], json!({"type": "integer"}));
    }
}
