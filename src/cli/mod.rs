//! Command-line interface for stepforge.
//!
//! Provides the `run` and `validate` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, LogFormat, LogSettings};
