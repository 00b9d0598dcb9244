//! Native Ollama chat client (`/api/chat`).
//!
//! Ollama takes the response schema directly in `format` and images as raw
//! base64 strings on the message, so it gets its own client rather than
//! going through the OpenAI compatibility layer.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::provider::{send_error, status_error, GenerationRequest, GenerationResponse, LlmProvider, Usage};
use crate::error::LlmError;

/// Default local Ollama endpoint.
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Client for a local or remote Ollama server.
pub struct OllamaClient {
    base_url: String,
    http_client: Client,
}

impl OllamaClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Server URL (e.g. "http://localhost:11434")
    /// * `timeout` - Per-request timeout, `None` to wait indefinitely
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, LlmError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(request: GenerationRequest) -> Result<ChatRequest, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_message.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage {
                role: "system",
                content: system,
                images: None,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.user_message,
            images: request.image_base64.map(|image| vec![image]),
        });

        let format = match (&request.json_schema, request.wants_json) {
            (Some(schema), _) => Some(
                serde_json::to_value(schema)
                    .map_err(|e| LlmError::ParseError(format!("Invalid schema: {}", e)))?,
            ),
            (None, true) => Some(Value::String("json".to_string())),
            (None, false) => None,
        };

        let options = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            })
        } else {
            None
        };

        Ok(ChatRequest {
            model: request.model,
            messages,
            stream: false,
            format,
            options,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    message: ChatResponseMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .map(|e| e.error)
}

#[async_trait]
impl LlmProvider for OllamaClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let chat_request = Self::build_request(request)?;
        let url = format!("{}/api/chat", self.base_url);

        tracing::debug!(
            provider = "ollama",
            model = %chat_request.model,
            structured = chat_request.format.is_some(),
            "Sending chat request"
        );

        let http_response = self
            .http_client
            .post(&url)
            .json(&chat_request)
            .send()
            .await
            .map_err(send_error)?;

        if !http_response.status().is_success() {
            return Err(status_error(http_response, error_message).await);
        }

        let chat_response: ChatResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse Ollama response: {}", e)))?;

        let usage = match (chat_response.prompt_eval_count, chat_response.eval_count) {
            (None, None) => None,
            (prompt, completion) => {
                let prompt_tokens = prompt.unwrap_or(0);
                let completion_tokens = completion.unwrap_or(0);
                Some(Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                })
            }
        };

        Ok(GenerationResponse {
            text: chat_response.message.content,
            model: chat_response.model,
            usage,
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JsonSchema, Property};

    #[test]
    fn test_plain_chat_request() {
        let request = GenerationRequest::new("llama3.2", "Hi");
        let body = serde_json::to_value(OllamaClient::build_request(request).unwrap()).unwrap();

        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hi");
        assert!(body["messages"][0].get("images").is_none());
        assert!(body.get("format").is_none());
        assert!(body.get("options").is_none());
    }

    #[test]
    fn test_structured_chat_request() {
        let schema = JsonSchema::object().with_property("label", Property::of_type("string"));
        let request = GenerationRequest::new("llama3.2", "Classify")
            .with_system_message("Be strict")
            .with_json_schema(schema)
            .with_image("aW1n")
            .with_temperature(0.1)
            .with_max_tokens(64);
        let body = serde_json::to_value(OllamaClient::build_request(request).unwrap()).unwrap();

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["images"][0], "aW1n");
        assert_eq!(body["format"]["properties"]["label"]["type"], "string");
        assert_eq!(body["options"]["temperature"], 0.1);
        assert_eq!(body["options"]["num_predict"], 64);
    }

    #[test]
    fn test_json_mode_without_schema() {
        let mut request = GenerationRequest::new("m", "Q");
        request.wants_json = true;
        let body = serde_json::to_value(OllamaClient::build_request(request).unwrap()).unwrap();
        assert_eq!(body["format"], "json");
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error": "model 'x' not found"}"#),
            Some("model 'x' not found".to_string())
        );
        assert_eq!(error_message("oops"), None);
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/", None).unwrap();
        assert_eq!(client.base_url(), OLLAMA_BASE_URL);
    }
}
