//! Pipeline configuration.
//!
//! A pipeline is described by a YAML file:
//!
//! ```yaml
//! version: "1.0"
//! outputFolder: dataset
//! steps:
//!   - name: topics
//!     model: ollama:llama3.2
//!     prompt: "List one topic about {{ .SYSTEM.JSON_SCHEMA }}"
//!     maxResults: 5
//! ```
//!
//! Loading happens in three stages: environment expansion ([`env`]), YAML
//! parsing into [`PipelineConfig`], and validation into an immutable
//! [`crate::pipeline::Pipeline`] ([`PipelineConfig::into_pipeline`]). Every
//! problem found on the way is a [`ConfigError`] and stops the run before any
//! step executes.

pub mod duration;
pub mod env;
pub mod validate;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::error::TemplateError;
use crate::retry::RetryPolicy;
use crate::schema::JsonSchema;

pub use validate::is_valid_name;

/// The only pipeline file version understood by this crate.
pub const SUPPORTED_VERSION: &str = "1.0";

/// Default output folder.
pub const DEFAULT_OUTPUT_FOLDER: &str = "dataset";

/// Default per-request HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Record count used when `maxResults` is absent or not positive.
pub const DEFAULT_MAX_RESULTS: usize = 3;

/// Errors that can occur while loading or validating a pipeline.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Pipeline-level validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Validation of one step failed.
    #[error("step '{step}': {message}")]
    Step { step: String, message: String },

    /// A step prompt is not a valid template.
    #[error("step '{step}': {source}")]
    Template {
        step: String,
        #[source]
        source: TemplateError,
    },

    #[error("version '{0}' is unsupported, expected '{SUPPORTED_VERSION}'")]
    UnsupportedVersion(String),

    #[error("Failed to parse pipeline file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn step(step: &str, message: impl Into<String>) -> Self {
        ConfigError::Step {
            step: step.to_string(),
            message: message.into(),
        }
    }
}

/// A pipeline file as written by the user, before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub version: String,
    pub output_folder: Option<String>,
    /// Seconds; `0` disables the timeout.
    pub http_timeout: Option<u64>,
    pub validate_response: Option<bool>,
    pub skip_cli_warning: Option<bool>,
    pub verbose: Option<bool>,
    pub log_pretty: Option<bool>,
    pub retry_config: Option<RetryPolicy>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One entry of `steps:`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    #[serde(default)]
    pub name: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: Option<String>,
    /// Shell command; makes this a shell step.
    #[serde(alias = "cmd")]
    pub run: Option<String>,
    pub work_dir: Option<String>,
    pub max_results: Option<MaxResults>,
    pub json_schema: Option<JsonSchema>,
    #[serde(default)]
    pub model_config: ModelConfig,
    pub output_filename: Option<String>,
    pub image_path: Option<String>,
}

/// `maxResults`: a number or a `<step>.$length` reference.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MaxResults {
    Count(i64),
    Reference(String),
}

/// `modelConfig` of a generation step.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
}

impl PipelineConfig {
    /// Reads `path`, expands environment variables and parses the YAML.
    ///
    /// # Arguments
    ///
    /// * `path` - Pipeline file
    /// * `required_env` - Variables that must be set for the expansion
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read,
    /// `ConfigError::MissingEnvVar` if a required variable is unset and
    /// `ConfigError::Parse` for malformed YAML.
    pub async fn load(path: &Path, required_env: &[String]) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let expanded = env::expand_env(&text, required_env)?;
        let config = Self::from_yaml(&expanded)?;
        tracing::debug!(path = %path.display(), steps = config.steps.len(), "Loaded pipeline file");
        Ok(config)
    }

    /// Parses already-expanded YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Runtime settings from this file with `overrides` applied on top.
    pub fn settings(&self, overrides: &SettingsOverrides) -> RunSettings {
        let mut settings = RunSettings::default();
        if let Some(folder) = &self.output_folder {
            settings.output_folder = PathBuf::from(folder);
        }
        if let Some(secs) = self.http_timeout {
            settings = settings.with_http_timeout_secs(secs);
        }
        if let Some(validate) = self.validate_response {
            settings.validate_response = validate;
        }
        if let Some(skip) = self.skip_cli_warning {
            settings.skip_cli_warning = skip;
        }
        if let Some(verbose) = self.verbose {
            settings.verbose = verbose;
        }
        if let Some(pretty) = self.log_pretty {
            settings.log_pretty = pretty;
        }
        if let Some(retry) = &self.retry_config {
            settings.retry = retry.clone();
        }
        overrides.apply(settings)
    }
}

/// Settings that govern a run rather than individual steps.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Folder holding every step's output.
    pub output_folder: PathBuf,
    /// Per-request HTTP timeout; `None` waits indefinitely.
    pub http_timeout: Option<Duration>,
    /// Validate structured responses against the step schema.
    pub validate_response: bool,
    /// Do not ask for confirmation before running shell steps.
    pub skip_cli_warning: bool,
    pub verbose: bool,
    pub log_pretty: bool,
    pub retry: RetryPolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            output_folder: PathBuf::from(DEFAULT_OUTPUT_FOLDER),
            http_timeout: Some(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)),
            validate_response: true,
            skip_cli_warning: false,
            verbose: false,
            log_pretty: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl RunSettings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_folder.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "output folder is required".to_string(),
            ));
        }

        if let Some(name) = self.output_folder.file_name().and_then(|n| n.to_str()) {
            is_valid_name(name).map_err(|message| {
                ConfigError::ValidationFailed(format!("invalid output folder name: {}", message))
            })?;
        }

        self.retry
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                key: "retryConfig".to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    /// Builder method to set the output folder.
    pub fn with_output_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.output_folder = folder.into();
        self
    }

    /// Builder method to set the HTTP timeout in seconds; `0` disables it.
    pub fn with_http_timeout_secs(mut self, secs: u64) -> Self {
        self.http_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    /// Builder method to enable or disable response validation.
    pub fn with_validate_response(mut self, validate: bool) -> Self {
        self.validate_response = validate;
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Command-line values that take precedence over the pipeline file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsOverrides {
    pub output_folder: Option<PathBuf>,
    pub http_timeout_secs: Option<u64>,
    pub validate_response: Option<bool>,
    pub skip_cli_warning: Option<bool>,
    pub verbose: Option<bool>,
}

impl SettingsOverrides {
    fn apply(&self, mut settings: RunSettings) -> RunSettings {
        if let Some(folder) = &self.output_folder {
            settings.output_folder = folder.clone();
        }
        if let Some(secs) = self.http_timeout_secs {
            settings = settings.with_http_timeout_secs(secs);
        }
        if let Some(validate) = self.validate_response {
            settings.validate_response = validate;
        }
        if let Some(skip) = self.skip_cli_warning {
            settings.skip_cli_warning = skip;
        }
        if let Some(verbose) = self.verbose {
            settings.verbose = verbose;
        }
        settings
    }
}
