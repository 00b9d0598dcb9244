//! The generation capability shared by every backend.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::LlmError;
use crate::schema::JsonSchema;

/// Request for one generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    /// Backend-specific model name (without the provider prefix).
    pub model: String,
    /// Rendered user prompt.
    pub user_message: String,
    /// Optional system prompt.
    pub system_message: Option<String>,
    /// Ask the backend for a JSON object response.
    pub wants_json: bool,
    /// Schema the response must follow, sent to backends that support
    /// structured output.
    pub json_schema: Option<JsonSchema>,
    /// Base64-encoded image attached to the user message.
    pub image_base64: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    /// Creates a plain text request.
    pub fn new(model: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            user_message: user_message.into(),
            ..Self::default()
        }
    }

    /// Set the system prompt for this request.
    pub fn with_system_message(mut self, system: impl Into<String>) -> Self {
        self.system_message = Some(system.into());
        self
    }

    /// Request a JSON response following `schema`.
    pub fn with_json_schema(mut self, schema: JsonSchema) -> Self {
        self.wants_json = true;
        self.json_schema = Some(schema);
        self
    }

    /// Attach a base64-encoded image.
    pub fn with_image(mut self, image_base64: impl Into<String>) -> Self {
        self.image_base64 = Some(image_base64.into());
        self
    }

    /// Set the temperature for this request.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the max tokens for this request.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage statistics, when the backend reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Response from a generation request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResponse {
    /// Generated text, unmodified.
    pub text: String,
    /// Model that produced the text.
    pub model: String,
    pub usage: Option<Usage>,
}

impl GenerationResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Trait for LLM providers that can generate text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a response for the given request.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;

    /// Short backend name used in logs.
    fn name(&self) -> &str;
}

/// Maps a transport failure, keeping timeouts distinguishable.
pub(crate) fn send_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(err.to_string())
    } else {
        LlmError::RequestFailed(err.to_string())
    }
}

/// Turns a non-success HTTP response into an [`LlmError`].
///
/// `extract_message` pulls a human readable message out of the backend's
/// error body; the raw body is used when it returns `None`.
pub(crate) async fn status_error(
    response: reqwest::Response,
    extract_message: fn(&str) -> Option<String>,
) -> LlmError {
    let code = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());
    let message = extract_message(&body).unwrap_or(body);

    if code == 429 {
        LlmError::RateLimited(message)
    } else {
        LlmError::ApiError { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Property;

    #[test]
    fn test_request_builders() {
        let schema = JsonSchema::object().with_property("a", Property::of_type("string"));
        let request = GenerationRequest::new("llama3.2", "Hello")
            .with_system_message("Be brief")
            .with_json_schema(schema.clone())
            .with_image("aGk=")
            .with_temperature(0.3)
            .with_max_tokens(256);

        assert_eq!(request.model, "llama3.2");
        assert_eq!(request.user_message, "Hello");
        assert_eq!(request.system_message.as_deref(), Some("Be brief"));
        assert!(request.wants_json);
        assert_eq!(request.json_schema, Some(schema));
        assert_eq!(request.image_base64.as_deref(), Some("aGk="));
        assert_eq!(request.temperature, Some(0.3));
        assert_eq!(request.max_tokens, Some(256));
    }

    #[test]
    fn test_plain_request_defaults() {
        let request = GenerationRequest::new("m", "p");
        assert!(!request.wants_json);
        assert!(request.json_schema.is_none());
        assert!(request.image_base64.is_none());
    }
}
