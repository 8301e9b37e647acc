//! Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CoachModel, ModelError};
use crate::config::Settings;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Sampling parameters for one call class.
#[derive(Debug, Clone, Copy)]
struct Sampling {
    temperature: f32,
    max_tokens: u32,
}

/// `CoachModel` implementation backed by the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    full: Sampling,
    brief: Sampling,
    timeout: Duration,
}

impl AnthropicClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: settings.anthropic_api_key.clone(),
            model: settings.model_name.clone(),
            full: Sampling {
                temperature: settings.temperature,
                max_tokens: settings.max_tokens,
            },
            brief: Sampling {
                temperature: settings.brief_temperature,
                max_tokens: settings.brief_max_tokens,
            },
            timeout: settings.request_timeout,
        }
    }

    async fn send(
        &self,
        system: Option<&str>,
        prompt: &str,
        sampling: Sampling,
    ) -> Result<String, ModelError> {
        let body = CreateMessageRequest {
            model: &self.model,
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            system,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let request = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))?
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body_text)
                .map(|wrapper| wrapper.error.message)
                .unwrap_or(body_text);
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: CreateMessageResponse = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))?
            .map_err(|e| ModelError::Request(format!("Failed to parse response: {}", e)))?;

        parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
            })
            .ok_or(ModelError::EmptyResponse)
    }
}

#[async_trait]
impl CoachModel for AnthropicClient {
    async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String, ModelError> {
        self.send(system, prompt, self.full).await
    }

    async fn complete_brief(&self, prompt: &str) -> Result<String, ModelError> {
        self.send(None, prompt, self.brief).await
    }
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_shape() {
        let body = CreateMessageRequest {
            model: "claude-sonnet-4-20250514",
            max_tokens: 256,
            temperature: 0.3,
            system: None,
            messages: vec![Message {
                role: "user",
                content: "hello",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "claude-sonnet-4-20250514");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("system").is_none());
    }

    #[test]
    fn test_response_text_extraction() {
        let raw = r#"{"content": [{"type": "text", "text": "What's on your mind today?"}]}"#;
        let parsed: CreateMessageResponse = serde_json::from_str(raw).unwrap();
        let text = parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
            })
            .unwrap();
        assert_eq!(text, "What's on your mind today?");
    }

    #[test]
    fn test_error_body_decoding() {
        let raw = r#"{"error": {"type": "overloaded_error", "message": "Overloaded"}}"#;
        let parsed: ApiErrorResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.error.message, "Overloaded");
    }
}
