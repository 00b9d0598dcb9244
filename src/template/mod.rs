//! Prompt templates with cross-step placeholders.
//!
//! A prompt may reference values produced by earlier steps with
//! `{{ .<step>[.<dotted.path>] }}`. Parsing splits the reference on the first
//! `.` into the step name and the remaining field path. Rendering is a single
//! substitution pass against a [`ValueStore`]: there are no loops, conditions
//! or pipelines, and a reference without a value renders as `<no value>`.
//!
//! The reserved pseudo-step [`SYSTEM_STEP`] carries values injected by the
//! engine itself, currently `{{ .SYSTEM.JSON_SCHEMA }}`.
//!
//! # Example
//!
//! ```ignore
//! use stepforge::template::{PromptBuilder, Template};
//!
//! let template = Template::parse("Hi {{ .A.user.name }}")?;
//! let mut builder = PromptBuilder::new(template);
//! builder.add_value("A", "user.name", "rec-1", "Ada");
//! assert_eq!(builder.build(), "Hi Ada");
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TemplateError;
use crate::utils::field_path::{lookup_path, stringify};

/// Reserved pseudo-step holding engine-injected values.
pub const SYSTEM_STEP: &str = "SYSTEM";

/// Key under [`SYSTEM_STEP`] holding the step's own schema text.
pub const JSON_SCHEMA_KEY: &str = "JSON_SCHEMA";

/// Text rendered for a reference with no value.
pub const NO_VALUE: &str = "<no value>";

/// A `{{ .step.field.path }}` reference found in a template.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Placeholder {
    /// Referenced step name.
    pub step: String,
    /// Dotted path inside the step's record, empty for the whole record.
    pub field_path: String,
}

impl Placeholder {
    /// Key used for provenance: `step.fieldPath`, or `step` for a whole
    /// record reference.
    pub fn key(&self) -> String {
        provenance_key(&self.step, &self.field_path)
    }

    fn from_reference(reference: &str) -> Result<Self, TemplateError> {
        let body = reference.strip_prefix('.').unwrap_or(reference);
        let (step, field_path) = match body.split_once('.') {
            Some((step, rest)) => (step, rest),
            None => (body, ""),
        };
        if step.is_empty() {
            return Err(TemplateError::EmptyStepName(reference.to_string()));
        }
        Ok(Self {
            step: step.to_string(),
            field_path: field_path.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Reference(Placeholder),
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses `text`, rejecting any `{{ ... }}` action that is not a plain
    /// dotted reference.
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = text;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + open))?;
            let action = after_open[..close].trim();

            if !is_reference(action) {
                return Err(TemplateError::UnsupportedAction(action.to_string()));
            }
            segments.push(Segment::Reference(Placeholder::from_reference(action)?));

            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: text.to_string(),
            segments,
        })
    }

    /// The original template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// All distinct references in the template.
    pub fn placeholders(&self) -> BTreeSet<Placeholder> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Reference(p) => Some(p.clone()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Renders the template against `values` in a single pass.
    pub fn render(&self, values: &ValueStore) -> String {
        let context = values.to_context();
        let mut output = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Reference(placeholder) => {
                    output.push_str(&resolve(values, &context, placeholder));
                }
            }
        }
        output
    }
}

/// Returns every placeholder referenced in `text`.
///
/// Actions that are not dotted references are ignored here; use
/// [`Template::parse`] to reject them.
pub fn parse_placeholders(text: &str) -> BTreeSet<Placeholder> {
    let mut found = BTreeSet::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        let action = after_open[..close].trim();
        if is_reference(action) {
            if let Ok(placeholder) = Placeholder::from_reference(action) {
                found.insert(placeholder);
            }
        }
        rest = &after_open[close + 2..];
    }
    found
}

/// Parses and renders `text` in one call.
pub fn render(text: &str, values: &ValueStore) -> Result<String, TemplateError> {
    Ok(Template::parse(text)?.render(values))
}

fn is_reference(action: &str) -> bool {
    action.starts_with('.') && !action.chars().any(|c| c.is_whitespace() || c == '}')
}

/// A stored value for the exact reference wins; the nested context only
/// serves references that were not read directly.
fn resolve(
    values: &ValueStore,
    context: &Map<String, Value>,
    placeholder: &Placeholder,
) -> String {
    if let Some(stored) = values.get(&placeholder.step, &placeholder.field_path) {
        return stored.value.clone();
    }
    context
        .get(&placeholder.step)
        .and_then(|value| lookup_path(value, &placeholder.field_path).ok())
        .map(stringify)
        .unwrap_or_else(|| NO_VALUE.to_string())
}

/// A value read from an upstream record, with the id of its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepValue {
    pub id: String,
    pub value: String,
}

impl StepValue {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
        }
    }
}

/// Values available to a render, keyed by step then field path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStore {
    steps: BTreeMap<String, BTreeMap<String, StepValue>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value for `step` at `field_path`. An empty path stands for
    /// the whole record.
    pub fn insert(&mut self, step: &str, field_path: &str, value: StepValue) {
        self.steps
            .entry(step.to_string())
            .or_default()
            .insert(field_path.to_string(), value);
    }

    pub fn get(&self, step: &str, field_path: &str) -> Option<&StepValue> {
        self.steps.get(step).and_then(|fields| fields.get(field_path))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Provenance of every stored value except engine-injected ones, keyed
    /// by `step.fieldPath`.
    pub fn provenance(&self) -> BTreeMap<String, StepValue> {
        self.steps
            .iter()
            .filter(|(step, _)| step.as_str() != SYSTEM_STEP)
            .flat_map(|(step, fields)| {
                fields
                    .iter()
                    .map(move |(path, value)| (provenance_key(step, path), value.clone()))
            })
            .collect()
    }

    /// Reassembles the flat `step -> path -> value` entries into one nested
    /// JSON object per step so dotted references resolve by descent.
    fn to_context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        for (step, fields) in &self.steps {
            let mut object = Map::new();
            let mut whole = None;
            for (path, value) in fields {
                if path.is_empty() {
                    whole = Some(Value::String(value.value.clone()));
                } else {
                    set_nested(&mut object, path, Value::String(value.value.clone()));
                }
            }
            let entry = if object.is_empty() {
                whole.unwrap_or(Value::Null)
            } else {
                Value::Object(object)
            };
            context.insert(step.clone(), entry);
        }
        context
    }
}

fn set_nested(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = target;
    for part in parts {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

fn provenance_key(step: &str, field_path: &str) -> String {
    if field_path.is_empty() {
        step.to_string()
    } else {
        format!("{}.{}", step, field_path)
    }
}

/// Builds one prompt: collects upstream values for a template, injects the
/// schema text and renders.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: Template,
    values: ValueStore,
}

impl PromptBuilder {
    pub fn new(template: Template) -> Self {
        Self {
            template,
            values: ValueStore::new(),
        }
    }

    /// Distinct references in the template.
    pub fn placeholders(&self) -> BTreeSet<Placeholder> {
        self.template.placeholders()
    }

    /// Field paths referenced per step, so each upstream record is read once.
    /// [`SYSTEM_STEP`] references are excluded.
    pub fn placeholders_by_step(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for placeholder in self.placeholders() {
            if placeholder.step == SYSTEM_STEP {
                continue;
            }
            groups
                .entry(placeholder.step)
                .or_default()
                .push(placeholder.field_path);
        }
        groups
    }

    pub fn add_value(
        &mut self,
        step: &str,
        field_path: &str,
        id: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.values
            .insert(step, field_path, StepValue::new(id, value));
    }

    pub fn add_step_values(&mut self, step: &str, values: BTreeMap<String, StepValue>) {
        for (field_path, value) in values {
            self.values.insert(step, &field_path, value);
        }
    }

    /// Makes the step's own schema available as `{{ .SYSTEM.JSON_SCHEMA }}`.
    pub fn add_schema_text(&mut self, schema_text: impl Into<String>) {
        self.add_value(SYSTEM_STEP, JSON_SCHEMA_KEY, "", schema_text);
    }

    pub fn build(&self) -> String {
        self.template.render(&self.values)
    }

    pub fn provenance(&self) -> BTreeMap<String, StepValue> {
        self.values.provenance()
    }
}
