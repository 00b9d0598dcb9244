//! Shared utility functions for stepforge.
//!
//! This module provides helpers used across multiple modules: field path
//! resolution over JSON values and cleanup of raw LLM responses.

pub mod field_path;
pub mod json_extraction;

pub use field_path::{extract_by_path, lookup_path, stringify};
pub use json_extraction::clean_response;
