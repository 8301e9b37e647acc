//! The per-turn processing pipeline.
//!
//! Each inbound user message runs through four stages — respond, extract,
//! decide, commit — over an ephemeral `TurnContext` rebuilt from the stored
//! session. Stages take the context by value and return a new one; nothing
//! is persisted here, so an aborted turn leaves the session untouched.
//!
//! Failure policy: respond is fatal (there is no safe default reply);
//! extract and decide degrade to the previous known-good values.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::llm::{CoachModel, ModelError, json};
use crate::phase::Phase;
use crate::store::{Role, SessionRecord};
use crate::transitions::{self, TransitionConfirmation};

use super::prompts;

/// One line of conversation history.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Ephemeral working state for a single turn.
///
/// Rebuilt from `SessionRecord` + message history on every inbound message;
/// never a held reference to stored state.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    /// Current phase; may advance during the decide stage.
    pub phase: Phase,
    /// Phase the session was in when this turn began. The commit stage
    /// charges this phase's counter, not the post-decision one.
    pub entered_phase: Phase,
    pub turn_count: u32,
    pub max_turns: u32,
    pub phase_turns: BTreeMap<Phase, u32>,
    pub history: Vec<ChatMessage>,
    /// The pending user message; cleared by the commit stage.
    pub input: String,
    /// The coach reply produced by the respond stage.
    pub reply: String,
    pub observations: String,
    pub commitment: String,
    pub key_insight: String,
    pub end_requested: bool,
    /// Set once the session has nothing left after this turn.
    pub should_end: bool,
}

impl TurnContext {
    pub fn from_session(
        session: &SessionRecord,
        history: Vec<ChatMessage>,
        input: String,
        end_requested: bool,
    ) -> Self {
        Self {
            session_id: session.id.clone(),
            phase: session.phase,
            entered_phase: session.phase,
            turn_count: session.turn_count,
            max_turns: session.max_turns,
            phase_turns: session.phase_turns.clone(),
            history,
            input,
            reply: String::new(),
            observations: session.observations.clone(),
            commitment: session.commitment.clone(),
            key_insight: session.key_insight.clone(),
            end_requested,
            should_end: false,
        }
    }

    pub fn turns_remaining(&self) -> u32 {
        self.max_turns.saturating_sub(self.turn_count)
    }

    /// Turns spent so far in the given phase.
    pub fn turns_in(&self, phase: Phase) -> u32 {
        self.phase_turns.get(&phase).copied().unwrap_or(0)
    }

    /// Qualitative signals derived from the accumulated state.
    fn signals(&self) -> transitions::TransitionSignals {
        transitions::TransitionSignals {
            concrete_example: self.history.len() >= 2,
            resistance_surfaced: self.observations.len() > 20,
            commitment_made: !self.commitment.is_empty(),
            user_requested_end: self.end_requested,
        }
    }

    /// The last few exchanges plus the in-flight one, for extraction.
    fn recent_exchange(&self) -> String {
        let start = self.history.len().saturating_sub(4);
        let mut text = prompts::format_history(&self.history[start..]);
        text.push_str(&format!(
            "\n\nUSER: {}\n\nCOACH: {}",
            self.input, self.reply
        ));
        text
    }
}

/// Extraction result shape returned by the model during challenge.
#[derive(Debug, serde::Deserialize)]
struct ExtractedInsights {
    #[serde(default)]
    observations: Option<String>,
    #[serde(default)]
    commitment: Option<String>,
    #[serde(default)]
    key_insight: Option<String>,
}

/// Runs the four pipeline stages against a model.
pub struct TurnPipeline<'a> {
    model: &'a dyn CoachModel,
}

impl<'a> TurnPipeline<'a> {
    pub fn new(model: &'a dyn CoachModel) -> Self {
        Self { model }
    }

    /// Run a full turn. On `Err` nothing has been committed and the caller
    /// must leave the session exactly as it was.
    pub async fn run(&self, ctx: TurnContext) -> Result<TurnContext, ModelError> {
        let ctx = self.respond(ctx).await?;
        let ctx = self.extract(ctx).await;
        let ctx = self.decide(ctx).await;
        Ok(commit(ctx))
    }

    /// Stage 1: generate the coach's reply for the current phase.
    async fn respond(&self, mut ctx: TurnContext) -> Result<TurnContext, ModelError> {
        let prompt = prompts::phase_prompt(&ctx);
        ctx.reply = self
            .model
            .complete(Some(prompts::SYSTEM_PROMPT), &prompt)
            .await?;
        Ok(ctx)
    }

    /// Stage 2: re-derive accumulated observations (and, during challenge,
    /// commitment / key insight) from the recent exchange. Only runs in the
    /// two working phases; any failure keeps the previous values.
    async fn extract(&self, mut ctx: TurnContext) -> TurnContext {
        match ctx.phase {
            Phase::Exploration => {
                let prompt = prompts::observation_prompt(&ctx.recent_exchange(), &ctx.observations);
                match self.model.complete_brief(&prompt).await {
                    Ok(text) if !text.trim().is_empty() => {
                        ctx.observations = text.trim().to_string();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(session = %ctx.session_id, "Observation extraction failed, keeping previous: {}", e);
                    }
                }
            }
            Phase::Challenge => {
                let prompt = prompts::insight_prompt(
                    &ctx.recent_exchange(),
                    &ctx.observations,
                    &ctx.commitment,
                    &ctx.key_insight,
                );
                match self.model.complete_brief(&prompt).await {
                    Ok(text) => match parse_insights(&text) {
                        Some(insights) => {
                            apply_if_present(&mut ctx.observations, insights.observations);
                            apply_if_present(&mut ctx.commitment, insights.commitment);
                            apply_if_present(&mut ctx.key_insight, insights.key_insight);
                        }
                        None => {
                            warn!(session = %ctx.session_id, "Insight extraction returned no parseable JSON, keeping previous");
                        }
                    },
                    Err(e) => {
                        warn!(session = %ctx.session_id, "Insight extraction failed, keeping previous: {}", e);
                    }
                }
            }
            Phase::Framing | Phase::Synthesis => {}
        }
        ctx
    }

    /// Stage 3: decide whether the phase advances.
    ///
    /// The forced-synthesis override wins outright. Otherwise the heuristic
    /// runs first; only when it wants to move is the model consulted for a
    /// confirmation, whose absence means "trust the heuristic".
    async fn decide(&self, mut ctx: TurnContext) -> TurnContext {
        if transitions::force_synthesis(ctx.turn_count, ctx.max_turns) && ctx.phase != Phase::Synthesis {
            debug!(session = %ctx.session_id, "Forcing synthesis with {} turns remaining", ctx.turns_remaining());
            ctx.phase = Phase::Synthesis;
            return ctx;
        }

        let phase_turns = ctx.turns_in(ctx.phase);
        let heuristic = transitions::evaluate(
            ctx.phase,
            ctx.turn_count,
            ctx.max_turns,
            phase_turns,
            ctx.signals(),
        );

        if !heuristic.should_transition {
            return ctx;
        }

        // Heuristic says the session is done after this phase.
        if heuristic.next_phase.is_none() {
            ctx.should_end = true;
            return ctx;
        }

        let confirmation = self.confirm(&ctx, phase_turns).await;
        let decision = transitions::resolve(heuristic, confirmation);
        if decision.should_transition
            && let Some(next) = decision.next_phase
        {
            debug!(session = %ctx.session_id, from = %ctx.phase, to = %next, "Phase transition: {}", decision.reasoning);
            ctx.phase = next;
        }
        ctx
    }

    async fn confirm(&self, ctx: &TurnContext, phase_turns: u32) -> Option<TransitionConfirmation> {
        let prompt = prompts::transition_prompt(ctx, phase_turns);
        match self.model.complete_brief(&prompt).await {
            Ok(text) => {
                let parsed = json::extract_object(&text)
                    .and_then(|value| serde_json::from_value(value).ok());
                if parsed.is_none() {
                    warn!(session = %ctx.session_id, "Transition confirmation unparseable, trusting heuristic");
                }
                parsed
            }
            Err(e) => {
                warn!(session = %ctx.session_id, "Transition confirmation failed, trusting heuristic: {}", e);
                None
            }
        }
    }
}

/// Stage 4: fold the exchange into the context.
///
/// Appends the user/coach pair to history, charges the turn to the phase
/// that was active when the turn began, and clears the input buffer.
fn commit(mut ctx: TurnContext) -> TurnContext {
    ctx.history.push(ChatMessage {
        role: Role::User,
        content: std::mem::take(&mut ctx.input),
    });
    ctx.history.push(ChatMessage {
        role: Role::Coach,
        content: ctx.reply.clone(),
    });

    *ctx.phase_turns.entry(ctx.entered_phase).or_insert(0) += 1;
    ctx.turn_count += 1;
    if ctx.turn_count >= ctx.max_turns {
        ctx.should_end = true;
    }
    ctx
}

fn parse_insights(text: &str) -> Option<ExtractedInsights> {
    json::extract_object(text).and_then(|value| serde_json::from_value(value).ok())
}

fn apply_if_present(slot: &mut String, value: Option<String>) {
    if let Some(value) = value
        && !value.trim().is_empty()
    {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted model double: pops canned results per call class.
    #[derive(Default)]
    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, ModelError>>>,
        briefs: Mutex<VecDeque<Result<String, ModelError>>>,
        brief_calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn with_reply(reply: &str) -> Self {
            let model = Self::default();
            model
                .replies
                .lock()
                .unwrap()
                .push_back(Ok(reply.to_string()));
            model
        }

        fn push_brief(&self, result: Result<String, ModelError>) {
            self.briefs.lock().unwrap().push_back(result);
        }

        fn brief_calls(&self) -> usize {
            self.brief_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CoachModel for ScriptedModel {
        async fn complete(&self, _system: Option<&str>, _prompt: &str) -> Result<String, ModelError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ModelError::EmptyResponse))
        }

        async fn complete_brief(&self, _prompt: &str) -> Result<String, ModelError> {
            self.brief_calls.fetch_add(1, Ordering::SeqCst);
            self.briefs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ModelError::EmptyResponse))
        }
    }

    fn context(phase: Phase, turn_count: u32, max_turns: u32) -> TurnContext {
        let mut history = Vec::new();
        for turn in 0..turn_count {
            history.push(ChatMessage {
                role: Role::User,
                content: format!("user message {}", turn),
            });
            history.push(ChatMessage {
                role: Role::Coach,
                content: format!("coach message {}", turn),
            });
        }
        TurnContext {
            session_id: "s-1".into(),
            phase,
            entered_phase: phase,
            turn_count,
            max_turns,
            phase_turns: BTreeMap::from([(phase, turn_count)]),
            history,
            input: "another message".into(),
            reply: String::new(),
            observations: String::new(),
            commitment: String::new(),
            key_insight: String::new(),
            end_requested: false,
            should_end: false,
        }
    }

    #[tokio::test]
    async fn test_respond_failure_is_fatal() {
        let model = ScriptedModel::default();
        let pipeline = TurnPipeline::new(&model);
        let result = pipeline.run(context(Phase::Framing, 0, 12)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_framing_turn_skips_extraction() {
        let model = ScriptedModel::with_reply("Tell me more about that.");
        let pipeline = TurnPipeline::new(&model);

        let ctx = context(Phase::Framing, 0, 12);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.reply, "Tell me more about that.");
        // Framing with an empty history produces no signals, so neither
        // extraction nor confirmation should have been consulted.
        assert_eq!(model.brief_calls(), 0);
        assert_eq!(out.phase, Phase::Framing);
        assert_eq!(out.turn_count, 1);
        assert_eq!(out.turns_in(Phase::Framing), 1);
    }

    #[tokio::test]
    async fn test_commit_appends_pair_and_clears_input() {
        let model = ScriptedModel::with_reply("reply");
        let pipeline = TurnPipeline::new(&model);

        let ctx = context(Phase::Framing, 0, 12);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.history.len(), 2);
        assert_eq!(out.history[0].role, Role::User);
        assert_eq!(out.history[0].content, "another message");
        assert_eq!(out.history[1].role, Role::Coach);
        assert!(out.input.is_empty());
    }

    #[tokio::test]
    async fn test_exploration_extraction_updates_observations() {
        let model = ScriptedModel::with_reply("What are you afraid of?");
        // First brief call: observation extraction. Second: confirmation is
        // not reached (phase_turns below budget, no resistance yet... the
        // new observations are long enough to surface resistance, but the
        // two-turn floor holds at phase_turns=1).
        model.push_brief(Ok("Afraid of looking incompetent in front of peers.".into()));

        let pipeline = TurnPipeline::new(&model);
        let ctx = context(Phase::Exploration, 1, 12);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(
            out.observations,
            "Afraid of looking incompetent in front of peers."
        );
        assert_eq!(out.phase, Phase::Exploration);
        assert_eq!(model.brief_calls(), 1);
    }

    #[tokio::test]
    async fn test_extraction_failure_keeps_previous_values() {
        let model = ScriptedModel::with_reply("reply");
        model.push_brief(Err(ModelError::Timeout(std::time::Duration::from_secs(30))));

        let pipeline = TurnPipeline::new(&model);
        let mut ctx = context(Phase::Exploration, 1, 12);
        ctx.observations = "previous observations".into();
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.observations, "previous observations");
    }

    #[tokio::test]
    async fn test_challenge_extraction_parses_full_insights() {
        let model = ScriptedModel::with_reply("When exactly will you do it?");
        model.push_brief(Ok(
            r#"{"observations": "Sees the cost now.", "commitment": "I will raise it Friday.", "key_insight": "Silence is the bigger risk."}"#.into(),
        ));
        // Commitment triggers the challenge->synthesis heuristic; confirm it.
        model.push_brief(Ok(
            r#"{"should_transition": true, "next_phase": "synthesis"}"#.into(),
        ));

        let pipeline = TurnPipeline::new(&model);
        let ctx = context(Phase::Challenge, 5, 12);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.commitment, "I will raise it Friday.");
        assert_eq!(out.key_insight, "Silence is the bigger risk.");
        assert_eq!(out.phase, Phase::Synthesis);
    }

    #[tokio::test]
    async fn test_challenge_extraction_garbage_keeps_previous() {
        let model = ScriptedModel::with_reply("reply");
        model.push_brief(Ok("not json at all".into()));
        model.push_brief(Ok(r#"{"should_transition": false}"#.into()));

        let pipeline = TurnPipeline::new(&model);
        let mut ctx = context(Phase::Challenge, 1, 12);
        ctx.commitment = "existing commitment".into();
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.commitment, "existing commitment");
    }

    #[tokio::test]
    async fn test_confirmation_decline_holds_phase() {
        let model = ScriptedModel::with_reply("reply");
        // Budget exhausted in exploration -> heuristic wants to move.
        model.push_brief(Ok("Still exploring the fear.".into()));
        model.push_brief(Ok(
            r#"{"should_transition": false, "next_phase": null}"#.into(),
        ));

        let pipeline = TurnPipeline::new(&model);
        let ctx = context(Phase::Exploration, 4, 12);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.phase, Phase::Exploration);
        assert_eq!(model.brief_calls(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_failure_falls_back_to_heuristic() {
        let model = ScriptedModel::with_reply("reply");
        model.push_brief(Ok("Still exploring.".into()));
        model.push_brief(Err(ModelError::Request("connection refused".into())));

        let pipeline = TurnPipeline::new(&model);
        let ctx = context(Phase::Exploration, 4, 12);
        let out = pipeline.run(ctx).await.unwrap();

        // Heuristic said move (budget spent); confirmation unavailable.
        assert_eq!(out.phase, Phase::Challenge);
    }

    #[tokio::test]
    async fn test_confirmation_garbage_falls_back_to_heuristic() {
        let model = ScriptedModel::with_reply("reply");
        model.push_brief(Ok("Still exploring.".into()));
        model.push_brief(Ok("I think we should definitely move on!".into()));

        let pipeline = TurnPipeline::new(&model);
        let ctx = context(Phase::Exploration, 4, 12);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.phase, Phase::Challenge);
    }

    #[tokio::test]
    async fn test_forced_synthesis_overrides_everything() {
        for phase in [Phase::Framing, Phase::Exploration, Phase::Challenge] {
            let model = ScriptedModel::with_reply("Let's wrap up.");
            if phase != Phase::Framing {
                // Extraction still runs in the working phases.
                model.push_brief(Ok("obs".into()));
            }
            let pipeline = TurnPipeline::new(&model);
            let ctx = context(phase, 10, 12);
            let out = pipeline.run(ctx).await.unwrap();
            assert_eq!(out.phase, Phase::Synthesis, "from {}", phase);
        }
    }

    #[tokio::test]
    async fn test_transition_turn_charges_entering_phase() {
        let model = ScriptedModel::with_reply("reply");
        model.push_brief(Ok("obs".into()));
        model.push_brief(Ok(
            r#"{"should_transition": true, "next_phase": "challenge"}"#.into(),
        ));

        let pipeline = TurnPipeline::new(&model);
        let ctx = context(Phase::Exploration, 4, 12);
        let before = ctx.turns_in(Phase::Exploration);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.phase, Phase::Challenge);
        assert_eq!(out.turns_in(Phase::Exploration), before + 1);
        assert_eq!(out.turns_in(Phase::Challenge), 0);
    }

    #[tokio::test]
    async fn test_user_requested_end_jumps_to_synthesis() {
        let model = ScriptedModel::with_reply("reply");
        model.push_brief(Ok(
            r#"{"should_transition": true, "next_phase": "synthesis"}"#.into(),
        ));

        let pipeline = TurnPipeline::new(&model);
        let mut ctx = context(Phase::Framing, 0, 12);
        ctx.end_requested = true;
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.phase, Phase::Synthesis);
    }

    #[tokio::test]
    async fn test_synthesis_budget_spent_marks_should_end() {
        let model = ScriptedModel::with_reply("Well done; you're ready.");
        let pipeline = TurnPipeline::new(&model);
        let ctx = context(Phase::Synthesis, 10, 12);
        let out = pipeline.run(ctx).await.unwrap();

        assert!(out.should_end);
        assert_eq!(out.phase, Phase::Synthesis);
    }

    #[tokio::test]
    async fn test_last_turn_marks_should_end() {
        let model = ScriptedModel::with_reply("reply");
        let pipeline = TurnPipeline::new(&model);
        let mut ctx = context(Phase::Synthesis, 11, 12);
        ctx.phase_turns = BTreeMap::from([(Phase::Synthesis, 1)]);
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.turn_count, 12);
        assert!(out.should_end);
    }
}
