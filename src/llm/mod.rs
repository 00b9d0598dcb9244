//! LLM integration for stepforge.
//!
//! Every backend implements [`LlmProvider`], the single generation capability
//! the pipeline engine talks to. Steps name their backend with a
//! `provider:model` reference such as `ollama:llama3.2` or
//! `openrouter:meta-llama/llama-3.3-70b-instruct`.
//!
//! ```ignore
//! use stepforge::llm::{build_provider, GenerationRequest, ProviderConfig, ProviderType};
//!
//! let config = ProviderConfig::new(ProviderType::Ollama);
//! let provider = build_provider(&config)?;
//! let response = provider
//!     .generate(GenerationRequest::new("llama3.2", "Write a haiku about Rust"))
//!     .await?;
//! println!("{}", response.text);
//! ```
//!
//! # Backends
//!
//! | Provider     | Client         | Default base URL                                          | API key env          |
//! |--------------|----------------|-----------------------------------------------------------|----------------------|
//! | `ollama`     | native         | `http://localhost:11434`                                  | none                 |
//! | `lmstudio`   | OpenAI-compat. | `http://127.0.0.1:1234/v1`                                | none                 |
//! | `openai`     | OpenAI-compat. | `https://api.openai.com/v1`                               | `OPENAI_API_KEY`     |
//! | `openrouter` | OpenAI-compat. | `https://openrouter.ai/api/v1`                            | `OPENROUTER_API_KEY` |
//! | `gemini`     | OpenAI-compat. | `https://generativelanguage.googleapis.com/v1beta/openai` | `GEMINI_API_KEY`     |

pub mod ollama;
pub mod openai;
pub mod provider;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use provider::{GenerationRequest, GenerationResponse, LlmProvider, Usage};

/// Supported generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    Ollama,
    LmStudio,
    OpenAi,
    OpenRouter,
    Gemini,
}

impl ProviderType {
    pub const ALL: [ProviderType; 5] = [
        ProviderType::Ollama,
        ProviderType::LmStudio,
        ProviderType::OpenAi,
        ProviderType::OpenRouter,
        ProviderType::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Ollama => "ollama",
            ProviderType::LmStudio => "lmstudio",
            ProviderType::OpenAi => "openai",
            ProviderType::OpenRouter => "openrouter",
            ProviderType::Gemini => "gemini",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::Ollama => ollama::OLLAMA_BASE_URL,
            ProviderType::LmStudio => "http://127.0.0.1:1234/v1",
            ProviderType::OpenAi => "https://api.openai.com/v1",
            ProviderType::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderType::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }

    /// Environment variable holding the API key, for hosted backends.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderType::Ollama | ProviderType::LmStudio => None,
            ProviderType::OpenAi => Some("OPENAI_API_KEY"),
            ProviderType::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderType::Gemini => Some("GEMINI_API_KEY"),
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderType::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = ProviderType::ALL.iter().map(|p| p.as_str()).collect();
                format!("unsupported provider '{}', expected one of: {}", s, known.join(", "))
            })
    }
}

/// Splits a `provider:model` reference. The model part may itself contain
/// colons (`ollama:llama3.2:1b`).
pub fn parse_model_ref(reference: &str) -> Result<(ProviderType, String), String> {
    let (provider, model) = reference
        .split_once(':')
        .ok_or_else(|| format!("model '{}' must have the form 'provider:model'", reference))?;
    if model.trim().is_empty() {
        return Err(format!("model '{}' has an empty model name", reference));
    }
    Ok((provider.trim().parse()?, model.trim().to_string()))
}

/// Everything needed to build a provider for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider: ProviderType,
    /// Overrides [`ProviderType::default_base_url`].
    pub base_url: Option<String>,
    /// Overrides the key read from [`ProviderType::api_key_env`].
    pub api_key: Option<String>,
    /// Per-request timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ProviderConfig {
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            base_url: None,
            api_key: None,
            timeout: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn effective_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| self.provider.default_base_url())
    }

    fn resolve_api_key(&self) -> Result<Option<String>, LlmError> {
        if let Some(key) = &self.api_key {
            return Ok(Some(key.clone()));
        }
        match self.provider.api_key_env() {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .ok()
                .filter(|k| !k.is_empty())
                .map(Some)
                .ok_or_else(|| LlmError::MissingApiKey(var.to_string())),
        }
    }
}

/// Builds the HTTP client for `config`.
///
/// # Errors
///
/// [`LlmError::MissingApiKey`] when a hosted backend has no key configured.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let base_url = config.effective_base_url().to_string();
    match config.provider {
        ProviderType::Ollama => Ok(Arc::new(OllamaClient::new(base_url, config.timeout)?)),
        other => Ok(Arc::new(OpenAiClient::new(
            other.as_str(),
            base_url,
            config.resolve_api_key()?,
            config.timeout,
        )?)),
    }
}

/// Source of providers for the pipeline runner.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, LlmError>;
}

/// Factory producing the real HTTP clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
        build_provider(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_ref() {
        assert_eq!(
            parse_model_ref("ollama:llama3.2").unwrap(),
            (ProviderType::Ollama, "llama3.2".to_string())
        );
        assert_eq!(
            parse_model_ref("ollama:llama3.2:1b").unwrap(),
            (ProviderType::Ollama, "llama3.2:1b".to_string())
        );
        assert_eq!(
            parse_model_ref("openrouter:meta-llama/llama-3.3-70b-instruct").unwrap(),
            (
                ProviderType::OpenRouter,
                "meta-llama/llama-3.3-70b-instruct".to_string()
            )
        );
        assert!(parse_model_ref("llama3.2").is_err());
        assert!(parse_model_ref("ollama:").is_err());
        assert!(parse_model_ref("bedrock:claude")
            .unwrap_err()
            .contains("unsupported provider 'bedrock'"));
    }

    #[test]
    fn test_provider_type_roundtrip() {
        for provider in ProviderType::ALL {
            assert_eq!(provider.as_str().parse::<ProviderType>().unwrap(), provider);
        }
    }

    #[test]
    fn test_effective_base_url() {
        let config = ProviderConfig::new(ProviderType::LmStudio);
        assert_eq!(config.effective_base_url(), "http://127.0.0.1:1234/v1");

        let config = config.with_base_url("http://gpu-box:1234/v1");
        assert_eq!(config.effective_base_url(), "http://gpu-box:1234/v1");

        let config = ProviderConfig::new(ProviderType::Gemini).with_base_url("");
        assert_eq!(
            config.effective_base_url(),
            "https://generativelanguage.googleapis.com/v1beta/openai"
        );
    }

    #[test]
    fn test_build_local_providers_without_keys() {
        let ollama = build_provider(&ProviderConfig::new(ProviderType::Ollama)).unwrap();
        assert_eq!(ollama.name(), "ollama");

        let lmstudio = build_provider(&ProviderConfig::new(ProviderType::LmStudio)).unwrap();
        assert_eq!(lmstudio.name(), "lmstudio");
    }

    #[test]
    fn test_explicit_api_key() {
        let config = ProviderConfig::new(ProviderType::OpenRouter).with_api_key("sk-test");
        let provider = HttpProviderFactory.create(&config).unwrap();
        assert_eq!(provider.name(), "openrouter");
    }
}
