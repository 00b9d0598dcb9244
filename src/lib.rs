//! stepforge: declarative multi-step dataset generation.
//!
//! This library runs pipelines of prompt and shell steps described in a YAML
//! file. Each step writes one JSONL file; later prompts pull values from
//! earlier records through `{{ .step.field }}` placeholders.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod fs;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod schema;
pub mod store;
pub mod template;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig, RunSettings, SettingsOverrides};
pub use error::{FieldPathError, LlmError, StoreError, TemplateError};
pub use pipeline::{Pipeline, PipelineError, PipelineRunner, RunSummary};
pub use retry::{RetryError, RetryPolicy};
pub use schema::{JsonSchema, ValidationError};
