//! Model boundary for all generation calls.
//!
//! Every judgment the pipeline outsources (coach replies, transition
//! confirmation, insight extraction, reflection synthesis) goes through the
//! `CoachModel` trait so tests can substitute scripted doubles for the
//! network client.

pub mod anthropic;
pub mod json;

use async_trait::async_trait;
use thiserror::Error;

pub use anthropic::AnthropicClient;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("model call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("model returned no text content")]
    EmptyResponse,
}

/// Abstraction over the conversation model for testability.
/// Real implementation: `AnthropicClient`. Tests use scripted doubles.
#[async_trait]
pub trait CoachModel: Send + Sync {
    /// Full-voice completion at the configured sampling temperature.
    /// Used for coach replies and reflection synthesis.
    async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String, ModelError>;

    /// Short, low-temperature completion for consistency-sensitive
    /// judgments: transition confirmation and insight extraction.
    async fn complete_brief(&self, prompt: &str) -> Result<String, ModelError>;
}
