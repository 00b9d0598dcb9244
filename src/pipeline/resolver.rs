//! Resolution of a step's desired record count.

use super::index::StepIndex;
use super::step::{DesiredCount, GenerationStep};
use super::PipelineError;
use crate::fs::count_images;
use crate::store::count_lines;

/// Turns the desired count of `generation` (step `step_name`) into a number.
///
/// A fixed count passes through. A `<step>.$length` reference resolves to
/// the number of images matched by the step's own `imagePath` when it has
/// one, otherwise to the number of records the referenced step wrote. The
/// referenced step has already completed because steps run in order.
///
/// # Errors
///
/// Returns `PipelineError::Count` if the referenced step is unknown or its
/// output cannot be read.
pub async fn resolve_count(
    step_name: &str,
    generation: &GenerationStep,
    index: &StepIndex<'_>,
) -> Result<usize, PipelineError> {
    let upstream_name = match &generation.count {
        DesiredCount::Fixed(n) => return Ok(*n),
        DesiredCount::LengthOf(name) => name,
    };

    let upstream = index.get(upstream_name).ok_or_else(|| {
        PipelineError::count(step_name, format!("reference step '{}' not found", upstream_name))
    })?;

    let resolved = match &generation.image_pattern {
        Some(pattern) => count_images(pattern).map_err(|e| PipelineError::count(step_name, e))?,
        None => count_lines(&upstream.output_path)
            .await
            .map_err(|e| PipelineError::count(step_name, e))?,
    };

    tracing::debug!(
        step = %step_name,
        upstream = %upstream_name,
        images = generation.image_pattern.is_some(),
        resolved = resolved,
        "Resolved record count"
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderType;
    use crate::pipeline::step::{ModelSettings, ShellStep, Step, StepKind};
    use crate::template::Template;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn generation(count: DesiredCount, image_pattern: Option<PathBuf>) -> GenerationStep {
        GenerationStep {
            provider: ProviderType::Ollama,
            model: "llama3.2".to_string(),
            template: Template::parse("hi").unwrap(),
            system_prompt: None,
            schema: None,
            count,
            settings: ModelSettings::default(),
            image_pattern,
        }
    }

    fn shell_step(name: &str, output: &Path) -> Step {
        Step {
            name: name.to_string(),
            kind: StepKind::Shell(ShellStep {
                command: format!("true > {}", output.display()),
                work_dir: output.parent().unwrap().to_path_buf(),
            }),
            output_path: output.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_fixed_count_passes_through() {
        let index = StepIndex::new(&[]);
        let step = generation(DesiredCount::Fixed(7), None);
        assert_eq!(resolve_count("s", &step, &index).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_length_of_upstream_records() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("ingest.jsonl");
        let lines: String = (0..7).map(|i| format!("{{\"n\":{}}}\n", i)).collect();
        tokio::fs::write(&output, lines).await.unwrap();

        let steps = vec![shell_step("ingest", &output)];
        let index = StepIndex::new(&steps);
        let step = generation(DesiredCount::LengthOf("ingest".to_string()), None);

        assert_eq!(resolve_count("answers", &step, &index).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_length_of_images() {
        let dir = TempDir::new().unwrap();
        for name in ["a.jpg", "b.jpg", "c.png"] {
            std::fs::write(dir.path().join(name), b"img").unwrap();
        }
        let output = dir.path().join("up.jsonl");
        std::fs::write(&output, "{}\n").unwrap();

        let steps = vec![shell_step("up", &output)];
        let index = StepIndex::new(&steps);
        let step = generation(
            DesiredCount::LengthOf("up".to_string()),
            Some(dir.path().join("*.jpg")),
        );

        assert_eq!(resolve_count("describe", &step, &index).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_or_missing_upstream() {
        let index = StepIndex::new(&[]);
        let step = generation(DesiredCount::LengthOf("ghost".to_string()), None);
        let err = resolve_count("s", &step, &index).await.unwrap_err();
        assert_eq!(err.step(), "s");
        assert!(err.to_string().contains("ghost"));

        let steps = vec![shell_step("up", Path::new("/nonexistent/up.jsonl"))];
        let index = StepIndex::new(&steps);
        let step = generation(DesiredCount::LengthOf("up".to_string()), None);
        assert!(matches!(
            resolve_count("s", &step, &index).await,
            Err(PipelineError::Count { .. })
        ));
    }
}
