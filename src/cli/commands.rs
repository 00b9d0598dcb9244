//! CLI command definitions for stepforge.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{PipelineConfig, SettingsOverrides};
use crate::pipeline::{Pipeline, PipelineRunner, RunSummary};

/// Declarative multi-step dataset generation.
#[derive(Parser, Debug)]
#[command(name = "stepforge")]
#[command(about = "Generate JSONL datasets from multi-step LLM pipelines")]
#[command(version)]
#[command(
    long_about = "stepforge runs the steps of a YAML pipeline file in order. Prompt steps call an LLM backend \
(ollama, lmstudio, openai, openrouter, gemini) once per record; shell steps run a command that writes a JSONL file. \
Later prompts can reference fields of earlier records with {{ .step.field }} placeholders.\n\n\
Example usage:\n  stepforge run --config pipeline.yaml --output ./dataset"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Shorthand for `--log-level debug`; shows content validation retries.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format. Defaults to the pipeline's `logPretty` setting.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline and write its dataset.
    Run(RunArgs),

    /// Check a pipeline file without running anything.
    #[command(alias = "check")]
    Validate(ValidateArgs),
}

/// Arguments for `run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Pipeline YAML file.
    #[arg(short, long, env = "STEPFORGE_CONFIG")]
    pub config: PathBuf,

    /// Output folder, overriding `outputFolder`.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Per-request HTTP timeout in seconds (0 disables), overriding `httpTimeout`.
    #[arg(long)]
    pub http_timeout: Option<u64>,

    /// Store structured responses without checking them against the schema.
    #[arg(long)]
    pub no_validate_response: bool,

    /// Run shell steps without asking for confirmation.
    #[arg(long)]
    pub skip_cli_warning: bool,

    /// Environment variable that must be set for `${VAR}` expansion (repeatable).
    #[arg(long = "require-env", value_name = "VAR")]
    pub require_env: Vec<String>,
}

/// Arguments for `validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Pipeline YAML file.
    #[arg(short, long, env = "STEPFORGE_CONFIG")]
    pub config: PathBuf,

    /// Environment variable that must be set for `${VAR}` expansion (repeatable).
    #[arg(long = "require-env", value_name = "VAR")]
    pub require_env: Vec<String>,
}

/// Log formatter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging setup derived from the command line and the pipeline file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
}

/// Logging keys of a pipeline file, read before the file is validated.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogSection {
    verbose: Option<bool>,
    log_pretty: Option<bool>,
}

impl Cli {
    fn config_path(&self) -> &Path {
        match &self.command {
            Commands::Run(args) => &args.config,
            Commands::Validate(args) => &args.config,
        }
    }

    /// Resolves the log filter and format.
    ///
    /// Flags win over the pipeline file. An unreadable file falls back to the
    /// defaults; the real error is reported once the command runs.
    pub fn log_settings(&self) -> LogSettings {
        let section: LogSection = std::fs::read_to_string(self.config_path())
            .ok()
            .and_then(|text| serde_yaml::from_str(&text).ok())
            .unwrap_or_default();

        let filter = if self.verbose || section.verbose == Some(true) {
            "debug".to_string()
        } else {
            self.log_level.clone()
        };
        let format = self.log_format.unwrap_or(match section.log_pretty {
            Some(false) => LogFormat::Json,
            _ => LogFormat::Pretty,
        });
        LogSettings { filter, format }
    }
}

/// Parse CLI arguments without executing.
///
/// Use this to access CLI arguments (like log_level) before running the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let verbose = cli.verbose;
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args, verbose).await,
        Commands::Validate(args) => run_validate_command(args).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn load_pipeline(
    config_path: &Path,
    require_env: &[String],
    overrides: &SettingsOverrides,
) -> anyhow::Result<Pipeline> {
    let config = PipelineConfig::load(config_path, require_env)
        .await
        .with_context(|| format!("Failed to load pipeline file {}", config_path.display()))?;
    config
        .into_pipeline(overrides)
        .with_context(|| format!("Invalid pipeline file {}", config_path.display()))
}

fn overrides_from(args: &RunArgs, verbose: bool) -> SettingsOverrides {
    SettingsOverrides {
        output_folder: args.output.clone(),
        http_timeout_secs: args.http_timeout,
        validate_response: args.no_validate_response.then_some(false),
        skip_cli_warning: args.skip_cli_warning.then_some(true),
        verbose: verbose.then_some(true),
    }
}

async fn run_pipeline_command(args: RunArgs, verbose: bool) -> anyhow::Result<()> {
    let overrides = overrides_from(&args, verbose);
    let pipeline = load_pipeline(&args.config, &args.require_env, &overrides).await?;
    info!(
        config = %args.config.display(),
        steps = pipeline.steps.len(),
        output = %pipeline.settings.output_folder.display(),
        "Loaded pipeline"
    );

    let commands: Vec<String> = pipeline
        .shell_commands()
        .into_iter()
        .map(str::to_string)
        .collect();
    if !commands.is_empty() && !pipeline.settings.skip_cli_warning {
        tokio::task::spawn_blocking(move || {
            confirm_shell_commands(&commands, io::stdin().lock(), io::stderr())
        })
        .await
        .context("Confirmation prompt failed")?
        .context("Failed to read confirmation")?;
    }

    let runner = PipelineRunner::new(&pipeline);
    if let Some(previous) = runner
        .prepare_output()
        .await
        .context("Failed to prepare output folder")?
    {
        println!("Previous output moved to {}", previous.display());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping the current step");
            interrupt.cancel();
        }
    });

    let summary = runner.run(&cancel).await.context("Pipeline run failed")?;
    print_summary(&summary, &pipeline);
    Ok(())
}

async fn run_validate_command(args: ValidateArgs) -> anyhow::Result<()> {
    let pipeline =
        load_pipeline(&args.config, &args.require_env, &SettingsOverrides::default()).await?;

    println!(
        "Pipeline {} is valid ({} steps)",
        args.config.display(),
        pipeline.steps.len()
    );
    for step in &pipeline.steps {
        let count = match step.as_generation() {
            Some(generation) => format!(", {} records", generation.count),
            None => String::new(),
        };
        println!(
            "  {:<20} {:<10} -> {}{}",
            step.name,
            step.kind_name(),
            step.output_path.display(),
            count
        );
    }
    Ok(())
}

/// Lists the commands a run will execute and waits for Enter.
fn confirm_shell_commands<R: BufRead, W: Write>(
    commands: &[String],
    mut input: R,
    mut output: W,
) -> io::Result<()> {
    writeln!(output, "WARNING: this pipeline runs the following shell commands:")?;
    for command in commands {
        writeln!(output, "  $ {}", command)?;
    }
    writeln!(
        output,
        "Review them before continuing. Press Enter to run the pipeline or Ctrl-C to abort."
    )?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(())
}

fn print_summary(summary: &RunSummary, pipeline: &Pipeline) {
    println!("\n=== Pipeline Complete ===");
    for step in &summary.steps {
        let rejected = if step.rejected > 0 {
            format!(" ({} responses rejected)", step.rejected)
        } else {
            String::new()
        };
        println!(
            "  {:<20} {:<10} {:>6} records in {:.1}s{}",
            step.name,
            step.kind,
            step.records,
            step.duration.as_secs_f64(),
            rejected
        );
    }
    println!(
        "Total: {} records in {:.1}s",
        summary.total_records(),
        summary.duration.as_secs_f64()
    );
    println!("Output: {}", pipeline.settings.output_folder.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "stepforge",
            "run",
            "--config",
            "pipeline.yaml",
            "--output",
            "out",
            "--http-timeout",
            "0",
            "--no-validate-response",
            "--require-env",
            "API_HOST",
            "--require-env",
            "API_TOKEN",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Commands::Run(args) = &cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.config, PathBuf::from("pipeline.yaml"));
        assert_eq!(args.require_env, vec!["API_HOST", "API_TOKEN"]);

        let overrides = overrides_from(args, cli.verbose);
        assert_eq!(overrides.output_folder, Some(PathBuf::from("out")));
        assert_eq!(overrides.http_timeout_secs, Some(0));
        assert_eq!(overrides.validate_response, Some(false));
        assert_eq!(overrides.skip_cli_warning, None);
        assert_eq!(overrides.verbose, Some(true));
    }

    #[test]
    fn test_parse_validate_with_global_flags() {
        let cli = Cli::try_parse_from([
            "stepforge",
            "validate",
            "-c",
            "p.yaml",
            "--log-level",
            "warn",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "warn");
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert!(matches!(cli.command, Commands::Validate(_)));
    }

    #[test]
    fn test_run_requires_config() {
        std::env::remove_var("STEPFORGE_CONFIG");
        assert!(Cli::try_parse_from(["stepforge", "run"]).is_err());
    }

    #[test]
    fn test_log_settings_from_pipeline_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "version: \"1.0\"\nverbose: true\nlogPretty: false\nsteps: []").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from(["stepforge", "validate", "--config", &path]).unwrap();
        assert_eq!(
            cli.log_settings(),
            LogSettings {
                filter: "debug".to_string(),
                format: LogFormat::Json,
            }
        );

        let cli = Cli::try_parse_from([
            "stepforge",
            "validate",
            "--config",
            &path,
            "--log-format",
            "pretty",
        ])
        .unwrap();
        assert_eq!(cli.log_settings().format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_settings_without_file() {
        let cli = Cli::try_parse_from([
            "stepforge",
            "run",
            "--config",
            "/nonexistent/pipeline.yaml",
            "-l",
            "trace",
        ])
        .unwrap();
        assert_eq!(
            cli.log_settings(),
            LogSettings {
                filter: "trace".to_string(),
                format: LogFormat::Pretty,
            }
        );
    }

    #[test]
    fn test_confirm_shell_commands() {
        let commands = vec!["curl -s https://example.com > data.jsonl".to_string()];
        let mut output = Vec::new();
        confirm_shell_commands(&commands, Cursor::new("\n"), &mut output).unwrap();

        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("WARNING"));
        assert!(shown.contains("$ curl -s https://example.com > data.jsonl"));
    }
}
