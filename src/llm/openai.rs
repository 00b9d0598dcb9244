//! OpenAI-compatible chat completions client.
//!
//! Serves OpenAI itself and every backend exposing the same
//! `/chat/completions` endpoint: OpenRouter, Gemini's OpenAI compatibility
//! layer and LM Studio.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::provider::{send_error, status_error, GenerationRequest, GenerationResponse, LlmProvider, Usage};
use crate::error::LlmError;

/// Client for OpenAI-compatible APIs.
pub struct OpenAiClient {
    /// Name reported in logs.
    name: String,
    /// Base URL for the API, without a trailing slash.
    api_base: String,
    /// Optional API key for authentication.
    api_key: Option<String>,
    /// HTTP client for making API requests.
    http_client: Client,
}

impl OpenAiClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `name` - Backend name used in logs (e.g. "openrouter")
    /// * `api_base` - Base URL of the API (e.g. "https://api.openai.com/v1")
    /// * `api_key` - Optional bearer token
    /// * `timeout` - Per-request timeout, `None` to wait indefinitely
    pub fn new(
        name: impl Into<String>,
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, LlmError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Check if an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_request(request: GenerationRequest) -> ApiRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_message.filter(|s| !s.trim().is_empty()) {
            messages.push(ApiMessage {
                role: "system",
                content: MessageContent::Text(system),
            });
        }

        let user_content = match request.image_base64 {
            Some(image) => MessageContent::Parts(vec![
                ContentPart::Text {
                    text: request.user_message,
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:image/jpeg;base64,{}", image),
                    },
                },
            ]),
            None => MessageContent::Text(request.user_message),
        };
        messages.push(ApiMessage {
            role: "user",
            content: user_content,
        });

        let response_format = match (&request.json_schema, request.wants_json) {
            (Some(schema), _) => Some(json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "json_schema",
                    "strict": true,
                    "schema": schema,
                }
            })),
            (None, true) => Some(json!({"type": "json_object"})),
            (None, false) => None,
        };

        ApiRequest {
            model: request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format,
        }
    }
}

/// Internal request structure for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

/// Internal response structure from the OpenAI-compatible API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ApiErrorResponse>(body)
        .ok()
        .map(|e| e.error.message)
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let api_request = Self::build_request(request);
        let url = format!("{}/chat/completions", self.api_base);

        tracing::debug!(
            provider = %self.name,
            model = %api_request.model,
            structured = api_request.response_format.is_some(),
            "Sending chat completion request"
        );

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(&api_request)
            .send()
            .await
            .map_err(send_error)?;

        if !http_response.status().is_success() {
            return Err(status_error(http_response, error_message).await);
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ParseError("Response contained no choices".to_string()))?;

        Ok(GenerationResponse {
            text,
            model: api_response.model,
            usage: api_response.usage,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JsonSchema, Property};

    #[test]
    fn test_client_trims_base_url() {
        let client = OpenAiClient::new("openai", "https://api.openai.com/v1/", None, None).unwrap();
        assert_eq!(client.api_base(), "https://api.openai.com/v1");
        assert!(!client.has_api_key());
        assert_eq!(client.name(), "openai");
    }

    #[test]
    fn test_plain_request_body() {
        let request = GenerationRequest::new("gpt-4o-mini", "Hello").with_temperature(0.5);
        let body = serde_json::to_value(OpenAiClient::build_request(request)).unwrap();

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_structured_request_body() {
        let schema = JsonSchema::object().with_property("answer", Property::of_type("string"));
        let request = GenerationRequest::new("gpt-4o-mini", "Q")
            .with_system_message("You are terse")
            .with_json_schema(schema);
        let body = serde_json::to_value(OpenAiClient::build_request(request)).unwrap();

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "You are terse");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["properties"]["answer"]["type"],
            "string"
        );
    }

    #[test]
    fn test_json_object_without_schema() {
        let mut request = GenerationRequest::new("m", "Q");
        request.wants_json = true;
        let body = serde_json::to_value(OpenAiClient::build_request(request)).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_image_request_body() {
        let request = GenerationRequest::new("m", "Describe").with_image("aGk=");
        let body = serde_json::to_value(OpenAiClient::build_request(request)).unwrap();

        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[0]["text"], "Describe");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,aGk=");
    }

    #[test]
    fn test_blank_system_prompt_is_skipped() {
        let request = GenerationRequest::new("m", "Q").with_system_message("   ");
        let body = serde_json::to_value(OpenAiClient::build_request(request)).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error": {"message": "bad key", "type": "auth"}}"#),
            Some("bad key".to_string())
        );
        assert_eq!(error_message("<html>502</html>"), None);
    }
}
