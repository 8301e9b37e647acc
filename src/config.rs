//! Runtime configuration, loaded from the environment.

use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Bounds and default for a session's total turn allowance.
#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    pub default_max_turns: u32,
    pub min_max_turns: u32,
    pub max_max_turns: u32,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            default_max_turns: 12,
            min_max_turns: 4,
            max_max_turns: 20,
        }
    }
}

impl TurnLimits {
    pub fn contains(&self, max_turns: u32) -> bool {
        (self.min_max_turns..=self.max_max_turns).contains(&max_turns)
    }
}

/// Settings for the service, read once at startup.
///
/// `.env` files are honored when present (loaded by the binary before this
/// runs); only `ANTHROPIC_API_KEY` is required.
#[derive(Debug, Clone)]
pub struct Settings {
    pub anthropic_api_key: String,
    pub model_name: String,
    /// Sampling temperature for coach-voice calls.
    pub temperature: f32,
    pub max_tokens: u32,
    /// Lower temperature for decision/extraction calls.
    pub brief_temperature: f32,
    pub brief_max_tokens: u32,
    /// Upper bound on any single model call.
    pub request_timeout: Duration,
    pub turn_limits: TurnLimits,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY is not set (add it to the environment or a .env file)")?;

        let model_name =
            std::env::var("MENTOR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            anthropic_api_key,
            model_name,
            temperature: env_parse("MENTOR_TEMPERATURE", 0.7)?,
            max_tokens: env_parse("MENTOR_MAX_TOKENS", 1024)?,
            brief_temperature: env_parse("MENTOR_BRIEF_TEMPERATURE", 0.3)?,
            brief_max_tokens: env_parse("MENTOR_BRIEF_MAX_TOKENS", 512)?,
            request_timeout: Duration::from_secs(env_parse("MENTOR_REQUEST_TIMEOUT_SECS", 60)?),
            turn_limits: TurnLimits {
                default_max_turns: env_parse("MENTOR_DEFAULT_MAX_TURNS", 12)?,
                ..TurnLimits::default()
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}
