//! Shell step: one external command producing the step's JSONL file.

use tokio_util::sync::CancellationToken;

use super::executor::{execute_command, CommandError, DEFAULT_COMMAND_TIMEOUT};
use super::step::ShellStep;
use super::PipelineError;
use crate::store::count_lines;

/// Runs `shell` for step `step_name` and returns the number of records in
/// its output file afterwards (0 if the command wrote nothing).
pub async fn run_shell_step(
    step_name: &str,
    shell: &ShellStep,
    output_path: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<usize, PipelineError> {
    tokio::fs::create_dir_all(&shell.work_dir)
        .await
        .map_err(|source| PipelineError::Command {
            step: step_name.to_string(),
            error: CommandError::WorkDir {
                path: shell.work_dir.clone(),
                source,
            },
        })?;

    execute_command(
        &shell.command,
        &shell.work_dir,
        Some(DEFAULT_COMMAND_TIMEOUT),
        cancel,
    )
    .await
    .map_err(|error| match error {
        CommandError::Cancelled { .. } => PipelineError::Cancelled {
            step: step_name.to_string(),
        },
        error => PipelineError::Command {
            step: step_name.to_string(),
            error,
        },
    })?;

    if !tokio::fs::try_exists(output_path).await.unwrap_or(false) {
        tracing::warn!(
            step = %step_name,
            output = %output_path.display(),
            "Command finished without creating its output file"
        );
        return Ok(0);
    }

    count_lines(output_path)
        .await
        .map_err(|e| PipelineError::persistence(step_name, e))
}
