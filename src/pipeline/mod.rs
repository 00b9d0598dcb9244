//! Step execution engine.
//!
//! A [`Pipeline`] is an ordered list of validated [`Step`]s. The
//! [`PipelineRunner`] executes them one at a time in declared order:
//!
//! 1. **Count resolution**: a step's desired record count is turned into a
//!    number right before it runs ([`resolver`])
//! 2. **Iteration**: generation steps build a prompt from upstream records,
//!    call the model through the retry wrapper, validate and persist one
//!    record per accepted iteration ([`prompt_step`])
//! 3. **Shell steps** run a single command that writes their JSONL file
//!    ([`shell_step`])
//!
//! Iteration `i` of a step only ever reads record `i` of the steps it
//! references (wrapping when an upstream step has fewer records).
//!
//! # Example
//!
//! ```rust,ignore
//! use stepforge::config::{PipelineConfig, SettingsOverrides};
//! use stepforge::pipeline::PipelineRunner;
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = PipelineConfig::load(path, &[]).await?
//!     .into_pipeline(&SettingsOverrides::default())?;
//!
//! let summary = PipelineRunner::new(&pipeline)
//!     .run(&CancellationToken::new())
//!     .await?;
//!
//! for step in &summary.steps {
//!     println!("{}: {} records", step.name, step.records);
//! }
//! ```

pub mod executor;
pub mod index;
pub mod prompt_step;
pub mod resolver;
pub mod runner;
pub mod shell_step;
pub mod step;
pub mod step_data;

use thiserror::Error;

use crate::config::RunSettings;
use crate::error::{LlmError, StoreError};
use crate::fs::FsError;
use crate::retry::RetryError;

pub use executor::CommandError;
pub use index::StepIndex;
pub use runner::{PipelineRunner, RunSummary, StepSummary};
pub use step::{DesiredCount, GenerationStep, ModelSettings, ShellStep, Step, StepKind};

/// A validated, immutable pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub settings: RunSettings,
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Looks a step up by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Commands of all shell steps, in step order.
    pub fn shell_commands(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Shell(shell) => Some(shell.command.as_str()),
                StepKind::Generation(_) => None,
            })
            .collect()
    }
}

/// Errors that stop a pipeline run. Every variant names the failing step.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The model backend for the step could not be created.
    #[error("step '{step}': failed to create provider: {error}")]
    Provider { step: String, error: LlmError },

    /// The desired record count could not be resolved.
    #[error("step '{step}': failed to resolve record count: {message}")]
    Count { step: String, message: String },

    /// Generation failed permanently or ran out of retries.
    #[error("step '{step}': generation failed at record {index}: {error}")]
    Capability {
        step: String,
        index: usize,
        error: RetryError<LlmError>,
    },

    /// Upstream values or images needed by the prompt could not be read.
    #[error("step '{step}': failed to build prompt for record {index}: {message}")]
    PromptConstruction {
        step: String,
        index: usize,
        message: String,
    },

    /// Writing the step's output failed.
    #[error("step '{step}': failed to persist records: {error}")]
    Persistence { step: String, error: StoreError },

    /// A shell step's command failed.
    #[error("step '{step}': {error}")]
    Command { step: String, error: CommandError },

    #[error("step '{step}': cancelled")]
    Cancelled { step: String },
}

impl PipelineError {
    /// Name of the step that failed.
    pub fn step(&self) -> &str {
        match self {
            PipelineError::Provider { step, .. }
            | PipelineError::Count { step, .. }
            | PipelineError::Capability { step, .. }
            | PipelineError::PromptConstruction { step, .. }
            | PipelineError::Persistence { step, .. }
            | PipelineError::Command { step, .. }
            | PipelineError::Cancelled { step } => step,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }

    pub(crate) fn prompt(step: &str, index: usize, message: impl ToString) -> Self {
        PipelineError::PromptConstruction {
            step: step.to_string(),
            index,
            message: message.to_string(),
        }
    }

    pub(crate) fn persistence(step: &str, error: StoreError) -> Self {
        PipelineError::Persistence {
            step: step.to_string(),
            error,
        }
    }

    pub(crate) fn count(step: &str, error: impl ToString) -> Self {
        PipelineError::Count {
            step: step.to_string(),
            message: error.to_string(),
        }
    }

    pub(crate) fn images(step: &str, index: usize, error: FsError) -> Self {
        Self::prompt(step, index, error)
    }
}
