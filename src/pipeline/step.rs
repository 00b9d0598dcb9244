//! Validated pipeline steps.
//!
//! Steps are built once from the configuration file by
//! [`crate::config::PipelineConfig::into_pipeline`] and are never mutated
//! afterwards. A step's desired record count is resolved to a concrete
//! number right before it runs (see [`super::resolver`]).

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::llm::{ProviderConfig, ProviderType};
use crate::schema::JsonSchema;
use crate::template::{Placeholder, Template};

/// How many records a generation step should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredCount {
    /// A fixed number of records.
    Fixed(usize),
    /// As many records as the named step produced (`<step>.$length`).
    LengthOf(String),
}

impl fmt::Display for DesiredCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredCount::Fixed(n) => write!(f, "{}", n),
            DesiredCount::LengthOf(step) => write!(f, "{}.$length", step),
        }
    }
}

/// Sampling and endpoint settings of a generation step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSettings {
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// A step that prompts a model once per record.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStep {
    pub provider: ProviderType,
    pub model: String,
    pub template: Template,
    pub system_prompt: Option<String>,
    pub schema: Option<JsonSchema>,
    pub count: DesiredCount,
    pub settings: ModelSettings,
    /// Glob of images attached to the prompts, one per iteration.
    pub image_pattern: Option<PathBuf>,
}

impl GenerationStep {
    /// The declared schema, if it actually declares something.
    pub fn structured_schema(&self) -> Option<&JsonSchema> {
        self.schema.as_ref().filter(|s| s.has_definition())
    }

    /// Whether responses are parsed and stored as JSON.
    pub fn is_structured(&self) -> bool {
        self.structured_schema().is_some()
    }
}

/// A step that runs one shell command producing a JSONL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellStep {
    pub command: String,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Generation(GenerationStep),
    Shell(ShellStep),
}

/// One validated pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    /// JSONL file holding this step's records.
    pub output_path: PathBuf,
}

impl Step {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Generation(_) => "generation",
            StepKind::Shell(_) => "shell",
        }
    }

    pub fn as_generation(&self) -> Option<&GenerationStep> {
        match &self.kind {
            StepKind::Generation(g) => Some(g),
            StepKind::Shell(_) => None,
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self.kind, StepKind::Shell(_))
    }

    /// Placeholders in this step's prompt (none for shell steps).
    pub fn placeholders(&self) -> BTreeSet<Placeholder> {
        match &self.kind {
            StepKind::Generation(g) => g.template.placeholders(),
            StepKind::Shell(_) => BTreeSet::new(),
        }
    }

    /// Provider settings for a generation step, `None` for shell steps.
    pub fn provider_config(&self, timeout: Option<std::time::Duration>) -> Option<ProviderConfig> {
        let generation = self.as_generation()?;
        let mut config = ProviderConfig::new(generation.provider).with_timeout(timeout);
        if let Some(base_url) = &generation.settings.base_url {
            config = config.with_base_url(base_url.clone());
        }
        Some(config)
    }
}
