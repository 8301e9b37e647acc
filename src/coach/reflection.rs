//! Post-session reflection synthesis.
//!
//! Converts a full transcript into a structured outcome record. Model
//! output is untrusted: structural validation gates every attempt, retries
//! are bounded, and exhaustion degrades to a placeholder record instead of
//! failing the end-session operation — by that point all the coaching has
//! already happened and is otherwise unrecoverable.

use serde::Deserialize;
use tracing::{error, warn};

use crate::llm::{CoachModel, json};
use crate::store::Outcome;

use super::prompts;

/// Total generation attempts: one original plus two retries.
const MAX_ATTEMPTS: usize = 3;

/// A validated reflection, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedReflection {
    pub observations: String,
    pub outcome: Outcome,
    pub insights: String,
    pub commitment: Option<String>,
    pub suggested_followup: Option<String>,
}

/// Raw field shape the model is asked to return.
#[derive(Debug, Deserialize)]
struct ReflectionOutput {
    #[serde(default)]
    key_observations: String,
    #[serde(default)]
    outcome_classification: String,
    #[serde(default)]
    insights_summary: String,
    #[serde(default)]
    commitment: Option<String>,
    #[serde(default)]
    suggested_followup: Option<String>,
}

pub struct ReflectionSynthesizer<'a> {
    model: &'a dyn CoachModel,
}

impl<'a> ReflectionSynthesizer<'a> {
    pub fn new(model: &'a dyn CoachModel) -> Self {
        Self { model }
    }

    /// Generate a reflection from the formatted transcript.
    ///
    /// Never fails: after `MAX_ATTEMPTS` invalid or errored attempts the
    /// degraded placeholder is returned, tagged with the last error.
    pub async fn synthesize(&self, transcript: &str) -> SynthesizedReflection {
        let base_prompt = prompts::reflection_prompt(transcript);
        let mut prompt = base_prompt.clone();
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=MAX_ATTEMPTS {
            match self.model.complete(None, &prompt).await {
                Ok(text) => match validate(&text) {
                    Ok(reflection) => return reflection,
                    Err(reason) => {
                        warn!(
                            "Reflection attempt {}/{} failed validation: {}",
                            attempt, MAX_ATTEMPTS, reason
                        );
                        last_error = reason;
                        prompt = format!("{}{}", base_prompt, prompts::STRICT_JSON_RETRY);
                    }
                },
                Err(e) => {
                    error!(
                        "Reflection attempt {}/{} failed: {}",
                        attempt, MAX_ATTEMPTS, e
                    );
                    last_error = e.to_string();
                }
            }
        }

        error!(
            "Reflection generation failed after {} attempts: {}",
            MAX_ATTEMPTS, last_error
        );
        degraded(&last_error)
    }
}

/// Structural validation of one model attempt.
fn validate(text: &str) -> Result<SynthesizedReflection, String> {
    let value = json::extract_object(text).ok_or("No JSON object in model output")?;
    let output: ReflectionOutput =
        serde_json::from_value(value).map_err(|e| format!("Unexpected field types: {}", e))?;

    if output.key_observations.trim().is_empty() {
        return Err("Missing key_observations".into());
    }
    if output.insights_summary.trim().is_empty() {
        return Err("Missing insights_summary".into());
    }
    let outcome: Outcome = output
        .outcome_classification
        .parse()
        .map_err(|e: String| e)?;

    Ok(SynthesizedReflection {
        observations: output.key_observations.trim().to_string(),
        outcome,
        insights: output.insights_summary.trim().to_string(),
        commitment: normalize(output.commitment),
        suggested_followup: normalize(output.suggested_followup),
    })
}

/// Models sometimes spell null as a string.
fn normalize(field: Option<String>) -> Option<String> {
    field.filter(|s| {
        let s = s.trim();
        !s.is_empty() && !s.eq_ignore_ascii_case("null") && !s.eq_ignore_ascii_case("none")
    })
}

fn degraded(last_error: &str) -> SynthesizedReflection {
    SynthesizedReflection {
        observations: format!(
            "Unable to generate observations due to a processing error: {}",
            last_error
        ),
        outcome: Outcome::PartialProgress,
        insights: "Session completed, but reflection generation did not produce valid output."
            .to_string(),
        commitment: None,
        suggested_followup: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedModel {
        responses: Mutex<VecDeque<Result<String, ModelError>>>,
        calls: AtomicUsize,
        last_prompt: Mutex<String>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String, ModelError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            }
        }
    }

    #[async_trait]
    impl CoachModel for ScriptedModel {
        async fn complete(&self, _system: Option<&str>, prompt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = prompt.to_string();
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ModelError::EmptyResponse))
        }

        async fn complete_brief(&self, _prompt: &str) -> Result<String, ModelError> {
            unreachable!("reflection synthesis never uses brief calls")
        }
    }

    const VALID: &str = r#"{
        "key_observations": "Avoids conflict to protect belonging; honest once the fear was named.",
        "outcome_classification": "breakthrough_achieved",
        "insights_summary": "Shifted from seeing silence as safe to seeing it as the costlier risk.",
        "commitment": "Raise the staffing concern in Friday's standup.",
        "suggested_followup": null
    }"#;

    #[tokio::test]
    async fn test_valid_output_first_attempt() {
        let model = ScriptedModel::new(vec![Ok(VALID.into())]);
        let reflection = ReflectionSynthesizer::new(&model)
            .synthesize("USER: hi\n\nCOACH: hello")
            .await;

        assert_eq!(reflection.outcome, Outcome::BreakthroughAchieved);
        assert_eq!(
            reflection.commitment.as_deref(),
            Some("Raise the staffing concern in Friday's standup.")
        );
        assert_eq!(reflection.suggested_followup, None);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fenced_output_is_accepted() {
        let fenced = format!("Here is the reflection:\n```json\n{}\n```", VALID);
        let model = ScriptedModel::new(vec![Ok(fenced)]);
        let reflection = ReflectionSynthesizer::new(&model).synthesize("transcript").await;
        assert_eq!(reflection.outcome, Outcome::BreakthroughAchieved);
    }

    #[tokio::test]
    async fn test_retry_appends_strict_instruction_then_succeeds() {
        let model = ScriptedModel::new(vec![Ok("not json".into()), Ok(VALID.into())]);
        let reflection = ReflectionSynthesizer::new(&model).synthesize("transcript").await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(reflection.outcome, Outcome::BreakthroughAchieved);
        assert!(
            model
                .last_prompt
                .lock()
                .unwrap()
                .contains("Return ONLY valid JSON")
        );
    }

    #[tokio::test]
    async fn test_invalid_outcome_value_triggers_retry() {
        let bad = r#"{"key_observations": "x", "outcome_classification": "total_victory", "insights_summary": "y"}"#;
        let model = ScriptedModel::new(vec![Ok(bad.into()), Ok(VALID.into())]);
        let reflection = ReflectionSynthesizer::new(&model).synthesize("transcript").await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(reflection.outcome, Outcome::BreakthroughAchieved);
    }

    #[tokio::test]
    async fn test_missing_narrative_field_triggers_retry() {
        let bad = r#"{"key_observations": "", "outcome_classification": "partial_progress", "insights_summary": "y"}"#;
        let model = ScriptedModel::new(vec![Ok(bad.into()), Ok(VALID.into())]);
        ReflectionSynthesizer::new(&model).synthesize("transcript").await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_degrade_to_placeholder() {
        let model = ScriptedModel::new(vec![
            Ok("garbage".into()),
            Ok("more garbage".into()),
            Ok("still garbage".into()),
        ]);
        let reflection = ReflectionSynthesizer::new(&model).synthesize("transcript").await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(reflection.outcome, Outcome::PartialProgress);
        assert!(reflection.observations.contains("processing error"));
        assert!(!reflection.observations.is_empty());
        assert_eq!(reflection.commitment, None);
    }

    #[tokio::test]
    async fn test_model_errors_also_degrade() {
        let model = ScriptedModel::new(vec![
            Err(ModelError::Request("connection refused".into())),
            Err(ModelError::Request("connection refused".into())),
            Err(ModelError::Request("connection refused".into())),
        ]);
        let reflection = ReflectionSynthesizer::new(&model).synthesize("transcript").await;

        assert_eq!(reflection.outcome, Outcome::PartialProgress);
        assert!(reflection.observations.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_string_null_commitment_normalized() {
        let output = r#"{
            "key_observations": "obs",
            "outcome_classification": "root_cause_identified",
            "insights_summary": "insights",
            "commitment": "null",
            "suggested_followup": "None"
        }"#;
        let model = ScriptedModel::new(vec![Ok(output.into())]);
        let reflection = ReflectionSynthesizer::new(&model).synthesize("transcript").await;

        assert_eq!(reflection.outcome, Outcome::RootCauseIdentified);
        assert_eq!(reflection.commitment, None);
        assert_eq!(reflection.suggested_followup, None);
    }
}
