//! Sequential pipeline runner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::index::StepIndex;
use super::prompt_step::PromptStepRunner;
use super::resolver::resolve_count;
use super::shell_step::run_shell_step;
use super::step::{Step, StepKind};
use super::{Pipeline, PipelineError};
use crate::fs::{create_versioned_folder, FsError};
use crate::llm::{HttpProviderFactory, LlmProvider, ProviderFactory};

/// Outcome of one completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
    pub name: String,
    pub kind: &'static str,
    /// Records in the step's output once it finished.
    pub records: usize,
    /// Responses discarded by validation (generation steps only).
    pub rejected: usize,
    pub duration: Duration,
}

/// Outcome of a complete run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: Vec<StepSummary>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn total_records(&self) -> usize {
        self.steps.iter().map(|s| s.records).sum()
    }
}

/// Runs the steps of a [`Pipeline`] one after another.
pub struct PipelineRunner<'a> {
    pipeline: &'a Pipeline,
    factory: Arc<dyn ProviderFactory>,
}

impl<'a> PipelineRunner<'a> {
    /// Creates a runner using the HTTP backends.
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self {
            pipeline,
            factory: Arc::new(HttpProviderFactory),
        }
    }

    /// Replaces the provider factory (mock backends in tests).
    pub fn with_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Moves an existing output folder aside and creates a fresh one.
    ///
    /// # Returns
    ///
    /// The new location of the previous folder, if there was one.
    pub async fn prepare_output(&self) -> Result<Option<PathBuf>, FsError> {
        let folder = &self.pipeline.settings.output_folder;
        tracing::debug!(folder = %folder.display(), "Preparing output folder");
        create_versioned_folder(folder).await
    }

    /// Creates the provider of every generation step up front so that a
    /// missing API key fails the run before any step executes.
    fn preflight(&self) -> Result<HashMap<&'a str, Arc<dyn LlmProvider>>, PipelineError> {
        let timeout = self.pipeline.settings.http_timeout;
        let mut providers = HashMap::new();
        for step in &self.pipeline.steps {
            if let Some(config) = step.provider_config(timeout) {
                let provider = self
                    .factory
                    .create(&config)
                    .map_err(|error| PipelineError::Provider {
                        step: step.name.clone(),
                        error,
                    })?;
                tracing::debug!(
                    step = %step.name,
                    provider = provider.name(),
                    base_url = config.effective_base_url(),
                    "Created provider"
                );
                providers.insert(step.name.as_str(), provider);
            }
        }
        Ok(providers)
    }

    /// Executes every step in declared order.
    ///
    /// # Errors
    ///
    /// Returns the first `PipelineError`; later steps are not started.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        let providers = self.preflight()?;
        let index = StepIndex::new(&self.pipeline.steps);
        let mut summary = RunSummary::default();

        for step in &self.pipeline.steps {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    step: step.name.clone(),
                });
            }

            info!(step = %step.name, kind = step.kind_name(), "Starting step");
            let step_start = Instant::now();

            let result = self.run_step(step, &index, &providers, cancel).await;
            let (records, rejected) = match result {
                Ok(counts) => counts,
                Err(e) => {
                    error!(step = %step.name, error = %e, "Step failed");
                    return Err(e);
                }
            };

            let duration = step_start.elapsed();
            info!(
                step = %step.name,
                records = records,
                duration_ms = duration.as_millis() as u64,
                "Completed step"
            );
            summary.steps.push(StepSummary {
                name: step.name.clone(),
                kind: step.kind_name(),
                records,
                rejected,
                duration,
            });
        }

        summary.duration = start.elapsed();
        Ok(summary)
    }

    async fn run_step(
        &self,
        step: &Step,
        index: &StepIndex<'_>,
        providers: &HashMap<&str, Arc<dyn LlmProvider>>,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), PipelineError> {
        match &step.kind {
            StepKind::Generation(generation) => {
                let provider = providers.get(step.name.as_str()).ok_or_else(|| {
                    PipelineError::Provider {
                        step: step.name.clone(),
                        error: crate::error::LlmError::RequestFailed(
                            "no provider created for step".to_string(),
                        ),
                    }
                })?;
                let count = resolve_count(&step.name, generation, index).await?;
                info!(step = %step.name, count = count, desired = %generation.count, "Resolved record count");

                let stats = PromptStepRunner::new(
                    step,
                    generation,
                    provider.as_ref(),
                    index,
                    &self.pipeline.settings,
                )
                .run(count, cancel)
                .await?;
                Ok((stats.records, stats.rejected))
            }
            StepKind::Shell(shell) => {
                let records = run_shell_step(&step.name, shell, &step.output_path, cancel).await?;
                Ok((records, 0))
            }
        }
    }
}
