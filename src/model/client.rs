//! Chat-completions client for OpenAI-compatible endpoints.

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
}

/// Configuration for the planner model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub extra_body: HashMap<String, Value>,
    /// Ask the endpoint for a JSON object response.
    pub json_mode: bool,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            max_tokens: 2000,
            temperature: 0.2,
            top_p: 0.9,
            extra_body: HashMap::new(),
            json_mode: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ModelConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }
}

/// Response from the model.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    /// Reasoning emitted inside `<think>` tags, if any.
    pub thinking: String,
    /// The answer with reasoning removed.
    pub content: String,
    pub raw_content: String,
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Client for OpenAI-compatible chat models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    pub fn new(config: ModelConfig) -> Self {
        let client = http_client(config.request_timeout_secs).unwrap_or_else(|e| {
            tracing::warn!(
                timeout_secs = config.request_timeout_secs,
                "Failed to build HTTP client, falling back to defaults without a timeout: {}",
                e
            );
            Client::new()
        });
        Self { config, client }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Send a request to the model, retrying transient failures.
    pub async fn request(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut body = json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
        });

        if let Value::Object(ref mut map) = body {
            if self.config.json_mode {
                map.insert("response_format".to_string(), json!({"type": "json_object"}));
            }
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        let mut last_error: Option<ModelError> = None;
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            match self.send_request(&url, &body).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if !Self::is_retryable_error(&e) {
                        return Err(e);
                    }
                    if attempt < max_attempts {
                        tracing::warn!(
                            model = %self.config.model_name,
                            "Request failed (attempt {}/{}): {}; retrying in {}s",
                            attempt,
                            max_attempts,
                            e,
                            self.config.retry_delay_secs
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(ModelError::MaxRetriesExceeded(
            self.config.max_retries,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Network errors, timeouts, rate limits and 5xx responses are retried.
    fn is_retryable_error(error: &ModelError) -> bool {
        match error {
            ModelError::RequestFailed(_) => true,
            ModelError::ApiError { status, message } => {
                *status == 429
                    || *status >= 500
                    || message.to_lowercase().contains("timeout")
                    || message.to_lowercase().contains("rate limit")
            }
            ModelError::ParseError(_) => false,
            ModelError::MaxRetriesExceeded(_, _) => false,
        }
    }

    async fn send_request(&self, url: &str, body: &Value) -> Result<ModelResponse, ModelError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let raw_content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelError::ParseError("No choices in response".to_string()))?;

        let (thinking, content) = Self::parse_response(&raw_content);
        Ok(ModelResponse {
            thinking,
            content,
            raw_content,
        })
    }

    /// Split `<think>...</think>` reasoning from the answer.
    fn parse_response(content: &str) -> (String, String) {
        let Some(start) = content.find("<think>") else {
            return (String::new(), content.trim().to_string());
        };
        let after = &content[start + "<think>".len()..];
        match after.find("</think>") {
            Some(end) => {
                let thinking = after[..end].trim().to_string();
                let answer = format!("{}{}", &content[..start], &after[end + "</think>".len()..]);
                (thinking, answer.trim().to_string())
            }
            // Unterminated reasoning: keep everything as the answer.
            None => (String::new(), content.replace("<think>", "").trim().to_string()),
        }
    }
}

/// Helper for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    pub fn create_user_message(text: &str) -> Value {
        json!({
            "role": "user",
            "content": text
        })
    }

    pub fn create_assistant_message(content: &str) -> Value {
        json!({
            "role": "assistant",
            "content": content
        })
    }
}

fn http_client(timeout_secs: u64) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_honours_timeout_setting() {
        assert!(http_client(DEFAULT_REQUEST_TIMEOUT_SECS).is_ok());
        let client = ModelClient::new(ModelConfig::default());
        assert_eq!(client.config().request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_model_config_builder() {
        let config = ModelConfig::default()
            .with_base_url("http://localhost:8000/v1")
            .with_model_name("planner")
            .with_max_retries(1)
            .with_json_mode(false);
        assert_eq!(config.base_url, "http://localhost:8000/v1");
        assert_eq!(config.model_name, "planner");
        assert_eq!(config.max_retries, 1);
        assert!(!config.json_mode);
    }

    #[test]
    fn test_parse_response_strips_thinking() {
        let content = "<think>The user wants flights</think>\n{\"steps\": []}";
        let (thinking, answer) = ModelClient::parse_response(content);
        assert_eq!(thinking, "The user wants flights");
        assert_eq!(answer, "{\"steps\": []}");
    }

    #[test]
    fn test_parse_response_plain() {
        let (thinking, answer) = ModelClient::parse_response("  {\"ok\": true} ");
        assert_eq!(thinking, "");
        assert_eq!(answer, "{\"ok\": true}");
    }

    #[test]
    fn test_retryable_errors() {
        let rate_limited = ModelError::ApiError {
            status: 429,
            message: "slow down".into(),
        };
        let bad_request = ModelError::ApiError {
            status: 400,
            message: "bad".into(),
        };
        let unavailable = ModelError::ApiError {
            status: 503,
            message: String::new(),
        };
        assert!(ModelClient::is_retryable_error(&rate_limited));
        assert!(ModelClient::is_retryable_error(&unavailable));
        assert!(!ModelClient::is_retryable_error(&bad_request));
        assert!(!ModelClient::is_retryable_error(&ModelError::ParseError("x".into())));
    }

    #[test]
    fn test_message_builder() {
        let system_msg = MessageBuilder::create_system_message("You are a planner");
        assert_eq!(system_msg["role"], "system");
        let user_msg = MessageBuilder::create_user_message("Hello");
        assert_eq!(user_msg["content"], "Hello");
    }
}
