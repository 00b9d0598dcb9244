//! Generation step executor.
//!
//! For each record index `i` in `[0, count)`:
//!
//! 1. Build the prompt from record `i` of every referenced upstream step and,
//!    for structured steps, the step's own schema text
//! 2. Call the model through [`retry::run`]: transient failures are retried
//!    within the policy's attempt budget, permanent ones abort the step
//! 3. Clean the response, parse it when the step declares a schema and,
//!    if enabled, validate it. A rejected response is discarded and index
//!    `i` is generated again with the same prompt
//! 4. Append the accepted record (flushed) and move to `i + 1`
//!
//! Content rejections have no retry budget. A model that never produces a
//! valid response keeps the step on the same index until the run is
//! cancelled; the rejection counter is logged at debug level.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::index::StepIndex;
use super::step::{GenerationStep, Step};
use super::step_data::read_values;
use super::PipelineError;
use crate::config::RunSettings;
use crate::fs::image_at;
use crate::llm::{GenerationRequest, LlmProvider};
use crate::retry::{self, classify_llm_error};
use crate::schema::validate;
use crate::store::{Payload, Record, RecordWriter};
use crate::template::{PromptBuilder, StepValue};

/// Provenance key suffix for the image attached to a prompt.
const IMAGE_FIELD: &str = "image";

/// Length of the base64 prefix used as an image's provenance id.
const IMAGE_ID_LEN: usize = 15;

/// Counters of a finished generation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationStats {
    /// Records written.
    pub records: usize,
    /// Responses discarded because they failed parsing or validation.
    pub rejected: usize,
}

/// A fully built prompt for one record index.
#[derive(Debug, Clone)]
struct PreparedPrompt {
    text: String,
    provenance: BTreeMap<String, StepValue>,
    image_base64: Option<String>,
}

/// Executes one generation step.
pub struct PromptStepRunner<'a> {
    step: &'a Step,
    generation: &'a GenerationStep,
    provider: &'a dyn LlmProvider,
    index: &'a StepIndex<'a>,
    settings: &'a RunSettings,
}

impl<'a> PromptStepRunner<'a> {
    /// Creates a runner for `step`.
    ///
    /// # Arguments
    ///
    /// * `step` - The step being executed
    /// * `generation` - Its generation settings
    /// * `provider` - Backend answering the prompts
    /// * `index` - Lookup of upstream steps
    /// * `settings` - Retry policy and response validation switch
    pub fn new(
        step: &'a Step,
        generation: &'a GenerationStep,
        provider: &'a dyn LlmProvider,
        index: &'a StepIndex<'a>,
        settings: &'a RunSettings,
    ) -> Self {
        Self {
            step,
            generation,
            provider,
            index,
            settings,
        }
    }

    /// Generates `count` records into the step's output file.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::PromptConstruction` when upstream values or
    /// images cannot be read, `PipelineError::Capability` when generation
    /// fails for good, `PipelineError::Persistence` when a record cannot be
    /// written and `PipelineError::Cancelled` when `cancel` fires. No partial
    /// record is written in any of these cases.
    pub async fn run(
        &self,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<GenerationStats, PipelineError> {
        let name = self.step.name.as_str();
        let schema_text = match self.generation.structured_schema() {
            Some(schema) => Some(
                schema
                    .to_json_text()
                    .map_err(|e| PipelineError::prompt(name, 0, e))?,
            ),
            None => None,
        };

        let mut writer = RecordWriter::open(&self.step.output_path)
            .await
            .map_err(|e| PipelineError::persistence(name, e))?;
        let mut stats = GenerationStats::default();

        for record_index in 0..count {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    step: name.to_string(),
                });
            }
            info!(step = %name, index = record_index, total = count, "Generating record");

            let prompt = self.prepare_prompt(record_index, schema_text.as_deref()).await?;
            let request = self.request_for(&prompt);

            let mut rejected_here = 0usize;
            let payload = loop {
                let response = retry::run(
                    &self.settings.retry,
                    cancel,
                    |_| self.provider.generate(request.clone()),
                    classify_llm_error,
                )
                .await
                .map_err(|error| {
                    if error.is_cancelled() {
                        PipelineError::Cancelled {
                            step: name.to_string(),
                        }
                    } else {
                        PipelineError::Capability {
                            step: name.to_string(),
                            index: record_index,
                            error,
                        }
                    }
                })?;

                match self.accept(&response.text) {
                    Ok(payload) => break payload,
                    Err(reason) => {
                        rejected_here += 1;
                        stats.rejected += 1;
                        debug!(
                            step = %name,
                            index = record_index,
                            rejected = rejected_here,
                            reason = %reason,
                            response = %response.text,
                            "Response rejected, generating the same record again"
                        );
                    }
                }
            };

            let record = Record::new(&prompt.text, payload, prompt.provenance);
            debug!(step = %name, index = record_index, id = %record.id, "Accepted response");
            writer
                .append(&record)
                .await
                .map_err(|e| PipelineError::persistence(name, e))?;
            stats.records = writer.written();
        }

        info!(
            step = %name,
            records = stats.records,
            rejected = stats.rejected,
            output = %writer.path().display(),
            "Generation step finished"
        );
        Ok(stats)
    }

    async fn prepare_prompt(
        &self,
        record_index: usize,
        schema_text: Option<&str>,
    ) -> Result<PreparedPrompt, PipelineError> {
        let name = self.step.name.as_str();
        let mut builder = PromptBuilder::new(self.generation.template.clone());
        if let Some(text) = schema_text {
            builder.add_schema_text(text);
        }

        for (upstream_name, field_paths) in builder.placeholders_by_step() {
            let upstream = self.index.get(&upstream_name).ok_or_else(|| {
                PipelineError::prompt(
                    name,
                    record_index,
                    format!("reference step '{}' not found", upstream_name),
                )
            })?;
            let values = read_values(upstream, &field_paths, record_index)
                .await
                .map_err(|e| PipelineError::prompt(name, record_index, e))?;
            builder.add_step_values(&upstream_name, values);
        }

        let text = builder.build();

        let image_base64 = match &self.generation.image_pattern {
            Some(pattern) => {
                let image = image_at(pattern, record_index)
                    .await
                    .map_err(|e| PipelineError::images(name, record_index, e))?;
                let id: String = image.base64.chars().take(IMAGE_ID_LEN).collect();
                builder.add_value(name, IMAGE_FIELD, id, image.path.display().to_string());
                Some(image.base64)
            }
            None => None,
        };

        debug!(step = %name, index = record_index, prompt = %text, "Built prompt");
        Ok(PreparedPrompt {
            text,
            provenance: builder.provenance(),
            image_base64,
        })
    }

    fn request_for(&self, prompt: &PreparedPrompt) -> GenerationRequest {
        let generation = self.generation;
        let mut request = GenerationRequest::new(generation.model.clone(), prompt.text.clone());
        if let Some(system) = &generation.system_prompt {
            request = request.with_system_message(system.clone());
        }
        if let Some(schema) = generation.structured_schema() {
            request = request.with_json_schema(schema.clone());
        }
        if let Some(image) = &prompt.image_base64 {
            request = request.with_image(image.clone());
        }
        if let Some(temperature) = generation.settings.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = generation.settings.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    /// Cleans and checks a response. The error is the rejection reason.
    fn accept(&self, raw: &str) -> Result<Payload, String> {
        let schema = self.generation.structured_schema();
        let payload = Payload::from_response(raw, schema.is_some())
            .map_err(|e| format!("response is not valid JSON: {}", e))?;

        if let (Some(schema), Payload::Json(value)) = (schema, &payload) {
            if self.settings.validate_response {
                validate(schema, value).map_err(|e| e.to_string())?;
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{GenerationResponse, ProviderType};
    use crate::pipeline::step::{DesiredCount, ModelSettings, ShellStep, StepKind};
    use crate::retry::{RetryError, RetryPolicy};
    use crate::schema::{JsonSchema, Property};
    use crate::store::read_line;
    use crate::template::Template;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Replays scripted responses and records every request.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<&str, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<GenerationRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(GenerationResponse::new(text)),
                Some(Err(e)) => Err(e),
                None => Err(LlmError::RequestFailed("script exhausted".to_string())),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn generation_step(dir: &Path, name: &str, prompt: &str, schema: Option<JsonSchema>) -> Step {
        Step {
            name: name.to_string(),
            kind: StepKind::Generation(GenerationStep {
                provider: ProviderType::Ollama,
                model: "llama3.2".to_string(),
                template: Template::parse(prompt).unwrap(),
                system_prompt: Some("You are terse.".to_string()),
                schema,
                count: DesiredCount::Fixed(2),
                settings: ModelSettings {
                    temperature: Some(0.3),
                    ..Default::default()
                },
                image_pattern: None,
            }),
            output_path: dir.join(format!("{}.jsonl", name)),
        }
    }

    fn user_schema() -> JsonSchema {
        JsonSchema::object().with_property(
            "user",
            Property::of_type("object").with_property("name", Property::of_type("string")),
        )
    }

    fn fast_settings() -> RunSettings {
        RunSettings::default().with_retry(
            RetryPolicy::default().with_delays(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    async fn line(step: &Step, index: usize) -> Value {
        serde_json::from_str(&read_line(&step.output_path, index).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_text_step_writes_records() {
        let dir = TempDir::new().unwrap();
        let step = generation_step(dir.path(), "greet", "Say hi", None);
        let steps = vec![step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![Ok("\"hello\""), Ok("```\nhey\n```")]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        let stats = runner.run(2, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats, GenerationStats { records: 2, rejected: 0 });

        let first = line(&step, 0).await;
        assert_eq!(first["format"], "text");
        assert_eq!(first["prompt"], "Say hi");
        assert_eq!(first["response"], "hello");
        assert!(first.get("values").is_none());
        assert_eq!(line(&step, 1).await["response"], "hey");

        let requests = provider.requests();
        assert_eq!(requests[0].model, "llama3.2");
        assert_eq!(requests[0].system_message.as_deref(), Some("You are terse."));
        assert_eq!(requests[0].temperature, Some(0.3));
        assert!(!requests[0].wants_json);
    }

    #[tokio::test]
    async fn test_invalid_responses_retry_same_index() {
        let dir = TempDir::new().unwrap();
        let step = generation_step(
            dir.path(),
            "people",
            "Invent someone. {{ .SYSTEM.JSON_SCHEMA }}",
            Some(user_schema()),
        );
        let steps = vec![step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![
            Ok("not json at all"),
            Ok(r#"{"user": {"name": 5}}"#),
            Ok(r#"```json
{"user": {"name": "Ada"}}
```"#),
        ]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        let stats = runner.run(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats, GenerationStats { records: 1, rejected: 2 });

        let record = line(&step, 0).await;
        assert_eq!(record["format"], "json");
        assert_eq!(record["response"], json!({"user": {"name": "Ada"}}));

        let requests = provider.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.user_message == requests[0].user_message));
        assert!(requests[0].wants_json);
        assert!(requests[0].json_schema.is_some());
        assert!(requests[0].user_message.contains("\"required\""));
    }

    #[tokio::test]
    async fn test_validation_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let step = generation_step(dir.path(), "people", "Invent", Some(user_schema()));
        let steps = vec![step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings().with_validate_response(false);
        let provider = ScriptedProvider::new(vec![Ok(r#"{"user": {"name": 5}}"#)]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        let stats = runner.run(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(line(&step, 0).await["response"]["user"]["name"], 5);
    }

    #[tokio::test]
    async fn test_placeholders_read_aligned_upstream_records() {
        let dir = TempDir::new().unwrap();
        let upstream_path = dir.path().join("fetch").join("rows.jsonl");
        std::fs::create_dir_all(upstream_path.parent().unwrap()).unwrap();
        std::fs::write(
            &upstream_path,
            "{\"topic\":\"rust\"}\n{\"topic\":\"go\"}\n",
        )
        .unwrap();
        let fetch = Step {
            name: "fetch".to_string(),
            kind: StepKind::Shell(ShellStep {
                command: "true > rows.jsonl".to_string(),
                work_dir: dir.path().join("fetch"),
            }),
            output_path: upstream_path,
        };
        let step = generation_step(dir.path(), "ask", "Question about {{ .fetch.topic }}", None);
        let steps = vec![fetch, step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![Ok("q1"), Ok("q2"), Ok("q3")]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        runner.run(3, &CancellationToken::new()).await.unwrap();

        let prompts: Vec<String> = provider
            .requests()
            .into_iter()
            .map(|r| r.user_message)
            .collect();
        assert_eq!(
            prompts,
            vec![
                "Question about rust",
                "Question about go",
                "Question about rust"
            ]
        );

        let record = line(&step, 1).await;
        assert_eq!(record["values"]["fetch.topic"]["value"], "go");
        assert_eq!(
            record["values"]["fetch.topic"]["id"],
            crate::pipeline::step_data::value_id("go")
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dir = TempDir::new().unwrap();
        let step = generation_step(dir.path(), "greet", "Hi", None);
        let steps = vec![step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::ApiError {
                code: 503,
                message: "busy".to_string(),
            }),
            Err(LlmError::Timeout("slow".to_string())),
            Ok("finally"),
        ]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        let stats = runner.run(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_aborts_without_partial_record() {
        let dir = TempDir::new().unwrap();
        let step = generation_step(dir.path(), "greet", "Hi", None);
        let steps = vec![step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![
            Ok("first"),
            Err(LlmError::ApiError {
                code: 401,
                message: "bad key".to_string(),
            }),
        ]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        let err = runner.run(2, &CancellationToken::new()).await.unwrap_err();
        match err {
            PipelineError::Capability { step, index, error } => {
                assert_eq!(step, "greet");
                assert_eq!(index, 1);
                assert!(matches!(error, RetryError::Permanent { attempt: 1, .. }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(provider.requests().len(), 2);
        assert_eq!(
            crate::store::count_lines(&step.output_path).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_upstream_field_aborts() {
        let dir = TempDir::new().unwrap();
        let upstream_path = dir.path().join("rows.jsonl");
        std::fs::write(&upstream_path, "{\"other\":1}\n").unwrap();
        let fetch = Step {
            name: "fetch".to_string(),
            kind: StepKind::Shell(ShellStep {
                command: "true > rows.jsonl".to_string(),
                work_dir: dir.path().to_path_buf(),
            }),
            output_path: upstream_path,
        };
        let step = generation_step(dir.path(), "ask", "About {{ .fetch.topic }}", None);
        let steps = vec![fetch, step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![Ok("unused")]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        let err = runner.run(1, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PromptConstruction { index: 0, .. }));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_images_are_attached() {
        let dir = TempDir::new().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("a.jpg"), b"first image").unwrap();
        std::fs::write(images.join("b.jpg"), b"second image").unwrap();

        let mut step = generation_step(dir.path(), "describe", "Describe the image", None);
        if let StepKind::Generation(generation) = &mut step.kind {
            generation.image_pattern = Some(images.join("*.jpg"));
        }
        let steps = vec![step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![Ok("a cat"), Ok("a dog")]);

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        runner.run(2, &CancellationToken::new()).await.unwrap();

        let requests = provider.requests();
        assert!(requests[0].image_base64.is_some());
        assert_ne!(requests[0].image_base64, requests[1].image_base64);

        let record = line(&step, 1).await;
        let image = &record["values"]["describe.image"];
        assert!(image["value"].as_str().unwrap().ends_with("b.jpg"));
        assert_eq!(image["id"].as_str().unwrap().len(), IMAGE_ID_LEN);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_record() {
        let dir = TempDir::new().unwrap();
        let step = generation_step(dir.path(), "greet", "Hi", None);
        let steps = vec![step.clone()];
        let index = StepIndex::new(&steps);
        let settings = fast_settings();
        let provider = ScriptedProvider::new(vec![Ok("never")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let runner = PromptStepRunner::new(
            &step,
            step.as_generation().unwrap(),
            &provider,
            &index,
            &settings,
        );
        let err = runner.run(1, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(provider.requests().is_empty());
    }
}
