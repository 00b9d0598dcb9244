//! Filesystem helpers: image inputs and the run's output folder.

pub mod folder;
pub mod images;

use std::path::PathBuf;

use thiserror::Error;

pub use folder::create_versioned_folder;
pub use images::{count_images, image_at, list_images, ImageInput};

/// Errors raised by the filesystem helpers.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("Invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("No files matched pattern '{0}'")]
    NoMatches(String),

    #[error("Failed to {action} '{path}': {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FsError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}
