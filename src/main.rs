//! stepforge CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use stepforge::cli::LogFormat;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get the log settings
    let cli = stepforge::cli::parse_cli();
    let log = cli.log_settings();

    // Priority: RUST_LOG env var > --verbose / --log-level > pipeline file > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| log.filter.clone());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter));

    match log.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    stepforge::cli::run_with_cli(cli).await
}
