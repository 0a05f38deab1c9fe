//! OpenAI chat-completions oracle.
//!
//! Sends the chunk prompt as a system + user message pair and asks for a
//! JSON object response. Only the message text is returned; parsing and
//! validation happen downstream.

use super::{ClassificationOracle, OracleError, OraclePrompt};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

pub struct OpenAiOracle {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiOracle {
    pub fn new(config: OpenAiConfig) -> Result<Self, OracleError> {
        if config.api_key.trim().is_empty() {
            return Err(OracleError::NotConfigured(
                "OpenAI API key is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                OracleError::NotConfigured(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn build_request<'a>(&'a self, prompt: &'a OraclePrompt) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        }
    }
}

#[async_trait]
impl ClassificationOracle for OpenAiOracle {
    fn name(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, prompt: &OraclePrompt) -> Result<String, OracleError> {
        let request = self.build_request(prompt);

        tracing::debug!(
            model = %self.config.model,
            chunk_id = prompt.chunk_id,
            prompt_len = prompt.user.len(),
            "Sending request to OpenAI API"
        );

        let response = self
            .client
            .post(self.api_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout(self.config.request_timeout.as_secs())
                } else {
                    OracleError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                429 => OracleError::RateLimited,
                400 => OracleError::InvalidRequest(error_text),
                code => OracleError::ApiError {
                    status: code,
                    message: error_text,
                },
            });
        }

        let api_response: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(self.config.request_timeout.as_secs())
            } else {
                OracleError::ApiError {
                    status: status.as_u16(),
                    message: format!("Failed to parse response: {}", e),
                }
            }
        })?;

        if let Some(usage) = &api_response.usage {
            tracing::debug!(
                chunk_id = prompt.chunk_id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "OpenAI usage"
            );
        }

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or(OracleError::EmptyResponse)?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(OracleError::ContentFiltered);
        }
        if choice.finish_reason.as_deref() == Some("length") {
            tracing::warn!(
                chunk_id = prompt.chunk_id,
                max_tokens = self.config.max_tokens,
                "OpenAI response truncated at token limit"
            );
        }

        match choice.message.content {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(OracleError::EmptyResponse),
        }
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenAiConfig {
        OpenAiConfig {
            api_key: "sk-test".to_string(),
            base_url: "https://api.example.com/v1/".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            max_tokens: 4000,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn empty_key_is_not_configured() {
        let mut cfg = config();
        cfg.api_key = "  ".to_string();
        assert!(matches!(
            OpenAiOracle::new(cfg),
            Err(OracleError::NotConfigured(_))
        ));
    }

    #[test]
    fn request_shape() {
        let oracle = OpenAiOracle::new(config()).unwrap();
        assert_eq!(oracle.api_url(), "https://api.example.com/v1/chat/completions");

        let prompt = OraclePrompt {
            chunk_id: 0,
            system: "rules".to_string(),
            user: "data".to_string(),
        };
        let body = serde_json::to_value(oracle.build_request(&prompt)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 4000);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "data");
    }

    #[test]
    fn response_without_content_deserializes() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":null},"finish_reason":"stop"}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
        assert!(parsed.usage.is_none());
    }
}
