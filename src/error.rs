//! Error types for stepforge operations.
//!
//! Defines error types for the leaf subsystems:
//! - LLM API interactions
//! - Placeholder parsing and prompt rendering
//! - Field path extraction from JSON values
//! - JSONL record persistence and reads
//!
//! Configuration and pipeline errors live next to the code that raises them
//! (`config::ConfigError`, `pipeline::PipelineError`).

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: {0} environment variable not set")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// HTTP status carried by this error, if it came from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LlmError::RateLimited(_) => Some(429),
            LlmError::ApiError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors that can occur while parsing or rendering prompt templates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Unsupported template action '{0}': only '{{{{ .step.field }}}}' references are allowed")]
    UnsupportedAction(String),

    #[error("Unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("Invalid placeholder '{0}': step name is empty")]
    EmptyStepName(String),
}

/// Errors raised when resolving a dotted path inside a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldPathError {
    #[error("cannot traverse field '{field}' on non-object value at path '{path}'")]
    NotAnObject { field: String, path: String },

    #[error("field '{field}' not found at path '{path}'")]
    Missing { field: String, path: String },
}

/// Errors that can occur while writing or reading JSONL record files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write record to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File '{0}' has no records")]
    Empty(PathBuf),

    #[error("Malformed line {line} in '{path}': {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
