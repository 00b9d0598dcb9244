//! Configuration-time validation.
//!
//! Turns a parsed [`PipelineConfig`] into an immutable [`Pipeline`]. Steps are
//! checked in declared order so a step can only see the steps before it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::{
    ConfigError, MaxResults, ModelConfig, PipelineConfig, SettingsOverrides, StepConfig,
    DEFAULT_MAX_RESULTS, SUPPORTED_VERSION,
};
use crate::llm::parse_model_ref;
use crate::pipeline::step::{
    DesiredCount, GenerationStep, ModelSettings, ShellStep, Step, StepKind,
};
use crate::pipeline::Pipeline;
use crate::template::{Template, JSON_SCHEMA_KEY, SYSTEM_STEP};

const JSONL_EXTENSION: &str = ".jsonl";
const LENGTH_SUFFIX: &str = ".$length";
const MAX_NAME_LEN: usize = 255;

fn illegal_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("Invalid regex for file name characters")
    })
}

/// Checks that `name` can be used as a file name on common platforms.
pub fn is_valid_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "name exceeds the maximum length of {} characters",
            MAX_NAME_LEN
        ));
    }
    if illegal_chars().is_match(name) {
        return Err("name contains invalid characters".to_string());
    }
    if name.ends_with(' ') || (name.len() > 1 && name.ends_with('.')) {
        return Err("name cannot end with a space or a period".to_string());
    }
    Ok(())
}

impl PipelineConfig {
    /// Validates the file and builds the pipeline.
    ///
    /// Relative paths (output folder, work dirs, image globs) are resolved
    /// against the current directory and the output folder respectively.
    ///
    /// # Errors
    ///
    /// Returns the first problem found as a `ConfigError`; step problems are
    /// reported as `ConfigError::Step` or `ConfigError::Template` naming the
    /// offending step.
    pub fn into_pipeline(self, overrides: &SettingsOverrides) -> Result<Pipeline, ConfigError> {
        let mut settings = self.settings(overrides);
        settings.validate()?;
        settings.output_folder = absolute(&settings.output_folder)?;
        self.build_steps(settings)
    }

    fn build_steps(self, settings: super::RunSettings) -> Result<Pipeline, ConfigError> {
        if self.version.is_empty() {
            return Err(ConfigError::ValidationFailed("version is required".to_string()));
        }
        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }
        if self.steps.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one step is required".to_string(),
            ));
        }

        let mut steps: Vec<Step> = Vec::with_capacity(self.steps.len());
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (index, config) in self.steps.into_iter().enumerate() {
            let name = config.name.trim().to_string();
            check_step_name(index, &name, &positions)?;

            let has_prompt = non_blank(&config.prompt).is_some();
            let has_run = non_blank(&config.run).is_some();
            let step = match (has_prompt, has_run) {
                (true, true) => {
                    return Err(ConfigError::step(
                        &name,
                        "either 'prompt' or 'run' should be defined, not both",
                    ))
                }
                (false, false) => {
                    return Err(ConfigError::step(
                        &name,
                        "either 'prompt' or 'run' must be defined",
                    ))
                }
                (true, false) => {
                    generation_step(name.clone(), config, &settings.output_folder, &steps, &positions)?
                }
                (false, true) => shell_step(name.clone(), config, &settings.output_folder)?,
            };

            tracing::debug!(
                step = %step.name,
                kind = step.kind_name(),
                output = %step.output_path.display(),
                "Validated step"
            );
            positions.insert(name, steps.len());
            steps.push(step);
        }

        Ok(Pipeline { settings, steps })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve_in(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn check_step_name(
    index: usize,
    name: &str,
    positions: &HashMap<String, usize>,
) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::ValidationFailed(format!(
            "step at index {}: name can't be empty",
            index
        )));
    }
    if name.eq_ignore_ascii_case(SYSTEM_STEP) {
        return Err(ConfigError::step(
            name,
            format!("'{}' is reserved and cannot be used as a step name", SYSTEM_STEP),
        ));
    }
    if positions.contains_key(name) {
        return Err(ConfigError::ValidationFailed(format!(
            "duplicate step name found: '{}'",
            name
        )));
    }
    is_valid_name(name).map_err(|e| ConfigError::step(name, format!("invalid step name: {}", e)))
}

fn shell_step(name: String, config: StepConfig, output_folder: &Path) -> Result<Step, ConfigError> {
    let command = config.run.unwrap_or_default().trim().to_string();
    let filename = non_blank(&config.output_filename)
        .map(str::trim)
        .ok_or_else(|| ConfigError::step(&name, "outputFilename is mandatory for shell steps"))?
        .to_string();

    is_valid_name(&filename).map_err(|e| {
        ConfigError::step(&name, format!("invalid output filename '{}': {}", filename, e))
    })?;
    if !command.contains(&filename) {
        return Err(ConfigError::step(
            &name,
            format!(
                "output filename should match the output of the command; run: [{}], output file: {}",
                command, filename
            ),
        ));
    }

    let work_dir = match non_blank(&config.work_dir) {
        Some(dir) => resolve_in(output_folder, dir),
        None => output_folder.to_path_buf(),
    };
    let output_path = work_dir.join(&filename);

    Ok(Step {
        name,
        kind: StepKind::Shell(ShellStep { command, work_dir }),
        output_path,
    })
}

fn generation_step(
    name: String,
    config: StepConfig,
    output_folder: &Path,
    earlier: &[Step],
    positions: &HashMap<String, usize>,
) -> Result<Step, ConfigError> {
    let model_ref = non_blank(&config.model)
        .ok_or_else(|| ConfigError::step(&name, "model definition can't be empty"))?;
    let (provider, model) =
        parse_model_ref(model_ref).map_err(|message| ConfigError::step(&name, message))?;

    let template = Template::parse(config.prompt.as_deref().unwrap_or_default()).map_err(
        |source| ConfigError::Template {
            step: name.clone(),
            source,
        },
    )?;

    let schema = config.json_schema;
    let declared = schema.as_ref().filter(|s| s.has_definition());
    if let Some(schema) = declared {
        schema.ensure_fully_required().map_err(|e| {
            ConfigError::step(&name, format!("invalid schema: {}", e))
        })?;
    }

    for placeholder in template.placeholders() {
        if placeholder.step == SYSTEM_STEP {
            if placeholder.field_path != JSON_SCHEMA_KEY {
                return Err(ConfigError::step(
                    &name,
                    format!(
                        "'{}' only provides '{}', got '{}'",
                        SYSTEM_STEP,
                        JSON_SCHEMA_KEY,
                        placeholder.key()
                    ),
                ));
            }
            if declared.is_none() {
                return Err(ConfigError::step(
                    &name,
                    format!(
                        "JSON schema is required when using '{{{{.{}.{}}}}}' in the prompt",
                        SYSTEM_STEP, JSON_SCHEMA_KEY
                    ),
                ));
            }
            continue;
        }

        let referenced = positions
            .get(&placeholder.step)
            .map(|&position| &earlier[position])
            .ok_or_else(|| {
                ConfigError::step(
                    &name,
                    format!(
                        "placeholder '{}' references unknown or later step '{}'",
                        placeholder.key(),
                        placeholder.step
                    ),
                )
            })?;

        if placeholder.field_path.is_empty() {
            continue;
        }
        if let Some(upstream) = referenced.as_generation() {
            let upstream_schema = upstream.structured_schema().ok_or_else(|| {
                ConfigError::step(
                    &name,
                    format!(
                        "step '{}' must declare a JSON schema to reference '{}'",
                        referenced.name, placeholder.field_path
                    ),
                )
            })?;
            if !upstream_schema.has_field_path(&placeholder.field_path) {
                return Err(ConfigError::step(
                    &name,
                    format!(
                        "'{}' must be declared as a required property in the JSON schema of step '{}'",
                        placeholder.field_path, referenced.name
                    ),
                ));
            }
        }
    }

    let settings = model_settings(&name, &config.model_config)?;
    let count = desired_count(&name, config.max_results, positions)?;

    let filename = non_blank(&config.output_filename)
        .map(str::trim)
        .unwrap_or(&name)
        .to_string();
    is_valid_name(&filename).map_err(|e| {
        ConfigError::step(&name, format!("invalid output filename '{}': {}", filename, e))
    })?;
    let filename = if filename.ends_with(JSONL_EXTENSION) {
        filename
    } else {
        format!("{}{}", filename, JSONL_EXTENSION)
    };

    let image_pattern = non_blank(&config.image_path).map(|p| resolve_in(output_folder, p));
    let system_prompt = non_blank(&config.system_prompt).map(str::to_string);

    Ok(Step {
        output_path: output_folder.join(filename),
        kind: StepKind::Generation(GenerationStep {
            provider,
            model,
            template,
            system_prompt,
            schema,
            count,
            settings,
            image_pattern,
        }),
        name,
    })
}

fn model_settings(step: &str, config: &ModelConfig) -> Result<ModelSettings, ConfigError> {
    if let Some(temperature) = config.temperature {
        if !(0.0..=1.0).contains(&temperature) {
            return Err(ConfigError::step(
                step,
                "modelConfig: temperature must be between 0 and 1",
            ));
        }
    }

    let max_tokens = match config.max_tokens {
        None => None,
        Some(tokens) if tokens > 0 => Some(u32::try_from(tokens).map_err(|_| {
            ConfigError::step(step, format!("modelConfig: maxTokens {} is too large", tokens))
        })?),
        Some(_) => {
            return Err(ConfigError::step(step, "modelConfig: maxTokens must be > 0"));
        }
    };

    let base_url = match config.base_url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(url) => {
            let parsed = reqwest::Url::parse(url).map_err(|e| {
                ConfigError::step(step, format!("modelConfig: invalid baseUrl '{}': {}", url, e))
            })?;
            if !parsed.has_host() {
                return Err(ConfigError::step(
                    step,
                    format!("modelConfig: invalid baseUrl '{}': missing host", url),
                ));
            }
            Some(url.to_string())
        }
    };

    Ok(ModelSettings {
        base_url,
        temperature: config.temperature,
        max_tokens,
    })
}

fn desired_count(
    step: &str,
    max_results: Option<MaxResults>,
    positions: &HashMap<String, usize>,
) -> Result<DesiredCount, ConfigError> {
    match max_results {
        None => Ok(DesiredCount::Fixed(DEFAULT_MAX_RESULTS)),
        Some(MaxResults::Count(n)) if n <= 0 => Ok(DesiredCount::Fixed(DEFAULT_MAX_RESULTS)),
        Some(MaxResults::Count(n)) => usize::try_from(n)
            .map(DesiredCount::Fixed)
            .map_err(|_| ConfigError::step(step, format!("maxResults {} is too large", n))),
        Some(MaxResults::Reference(reference)) => {
            let reference = reference.trim();
            if reference.is_empty() {
                return Ok(DesiredCount::Fixed(DEFAULT_MAX_RESULTS));
            }
            match reference.strip_suffix(LENGTH_SUFFIX) {
                Some(upstream) if positions.contains_key(upstream) => {
                    Ok(DesiredCount::LengthOf(upstream.to_string()))
                }
                Some(upstream) => Err(ConfigError::step(
                    step,
                    format!("maxResults references unknown or later step '{}'", upstream),
                )),
                None => Err(ConfigError::step(
                    step,
                    format!(
                        "invalid maxResults '{}', expected a number or '<step>{}'",
                        reference, LENGTH_SUFFIX
                    ),
                )),
            }
        }
    }
}
