//! Prompt templates for the coaching model calls.
//!
//! Builder functions assemble the phase, transition, extraction, and
//! reflection prompts from the turn context. Text lives here so the engine
//! modules stay free of prose.

use crate::phase::{Phase, PhaseBudgets};
use crate::store::Role;

use super::turn::{ChatMessage, TurnContext};

/// Core coach persona, sent as the system prompt on every reply call.
pub const SYSTEM_PROMPT: &str = "\
You are an expert reflective coach specializing in behavioral change. Your \
approach combines cognitive behavioral coaching, motivational interviewing, \
and Socratic questioning.

## Identity
- Warm yet direct; curious, not prescriptive
- Patient but persistent; you hold space for discomfort without rescuing

## Core beliefs
1. People have the answers within themselves; your job is to help them find those answers.
2. Resistance reveals what matters most.
3. Discomfort is information, not something to fix.
4. Small commitments lead to lasting change.
5. Insight without action is incomplete.

## You DO
- Ask powerful, open-ended questions
- Reflect back patterns and emotions you observe, using their exact words
- Challenge assumptions gently but firmly
- Surface the hidden costs of current patterns
- Guide toward specific, actionable commitments

## You DO NOT
- Give advice or solve their problems for them
- Judge, criticize, or shame
- Accept vague intentions (\"I'll try\")
- Rush past discomfort
- Over-validate or use excessive praise

## Style
Keep responses concise (2-4 sentences). Almost always end with a question. \
Use \"you\" language, not \"we\". When you sense resistance, name it and get \
curious rather than smoothing it over.";

/// Appended to a prompt when a structured-output attempt needs retrying.
pub const STRICT_JSON_RETRY: &str =
    "\n\nIMPORTANT: Return ONLY valid JSON. No markdown, no explanations.";

fn or_none(text: &str) -> &str {
    if text.trim().is_empty() {
        "(None yet)"
    } else {
        text
    }
}

/// Format message history for prompt injection.
pub fn format_history(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return "(No messages yet)".to_string();
    }
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "USER",
                Role::Coach => "COACH",
            };
            format!("{}: {}", role, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the phase-specific prompt for the coach's reply.
pub fn phase_prompt(ctx: &TurnContext) -> String {
    let budgets = PhaseBudgets::calculate(ctx.max_turns);
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "## Current Phase: {}\n\n",
        ctx.phase.as_str().to_uppercase()
    ));
    prompt.push_str(&format!(
        "### Session Budget\n\
         - Total turns available: {}\n\
         - Current turn: {}\n\
         - Turns remaining: {}\n\
         - Budget for this phase: {} turns ({} spent)\n\n",
        ctx.max_turns,
        ctx.turn_count,
        ctx.turns_remaining(),
        budgets.for_phase(ctx.phase),
        ctx.turns_in(ctx.phase),
    ));

    prompt.push_str(phase_guidance(ctx.phase));

    match ctx.phase {
        Phase::Framing => {}
        Phase::Exploration | Phase::Challenge => {
            prompt.push_str(&format!(
                "\n### Session Context\nObservations so far: {}\n",
                or_none(&ctx.observations)
            ));
        }
        Phase::Synthesis => {
            prompt.push_str(&format!(
                "\n### Session Context\n\
                 Commitment identified: {}\n\
                 Key insight: {}\n",
                or_none(&ctx.commitment),
                or_none(&ctx.key_insight)
            ));
        }
    }

    prompt.push_str(&format!(
        "\n### Conversation So Far\n{}\n\n### User's Message\n{}\n\n{}",
        format_history(&ctx.history),
        ctx.input,
        response_instruction(ctx.phase),
    ));

    prompt
}

fn phase_guidance(phase: Phase) -> &'static str {
    match phase {
        Phase::Framing => {
            "### Goals\n\
             1. Understand what brought them to this conversation\n\
             2. Identify the specific behavior pattern or challenge\n\
             3. Establish psychological safety and rapport\n\n\
             ### Approach\n\
             Start with open curiosity. Let them define the topic in their own \
             words, and ask for a recent, concrete example of the pattern. \
             Don't assume you know what the real issue is yet.\n"
        }
        Phase::Exploration => {
            "### Goals\n\
             1. Surface the emotional resistance beneath the behavior\n\
             2. Identify limiting beliefs and repeating patterns\n\
             3. Help them see what they might be avoiding\n\n\
             ### Techniques\n\
             Ground in specifics (\"Take me to a specific moment when...\"). \
             Uncover the internal story (\"What were you telling yourself?\"). \
             Explore the feared consequence (\"What were you afraid would \
             happen?\"). Name what you observe without judgment.\n"
        }
        Phase::Challenge => {
            "### Goals\n\
             1. Reality-test limiting beliefs and assumptions\n\
             2. Make the true cost of the current pattern visible\n\
             3. Move toward a concrete, specific commitment\n\n\
             ### Techniques\n\
             Test fears against evidence (\"How often has the worst case \
             actually happened?\"). Project forward (\"If nothing changes, \
             where does this leave you in six months?\"). Reframe the risk \
             (\"What if the real risk is inaction?\"). Push for \"I will\" plus \
             a timeframe; do not accept \"I'll try\".\n"
        }
        Phase::Synthesis => {
            "### Goals\n\
             1. Consolidate the key insight in their own words\n\
             2. Confirm the commitment: specific action, specific time\n\
             3. End with clarity and confidence\n\n\
             ### Techniques\n\
             Anchor their strongest statement back to them. Test confidence \
             (\"How confident are you, 1-10? What would make it higher?\"). \
             No new topics; do not weaken the commitment.\n"
        }
    }
}

fn response_instruction(phase: Phase) -> &'static str {
    match phase {
        Phase::Framing => {
            "### Your Response\n\
             Respond as the coach. Keep it concise (1-3 sentences). End with a \
             question that clarifies the specific pattern they want to explore."
        }
        Phase::Exploration => {
            "### Your Response\n\
             Respond as the coach. Keep it concise (2-4 sentences). Always end \
             with a probing question that goes deeper; don't accept \
             surface-level explanations."
        }
        Phase::Challenge => {
            "### Your Response\n\
             Respond as the coach. Be warm but direct, and push toward a \
             specific commitment. If they've made one, test its strength."
        }
        Phase::Synthesis => {
            "### Your Response\n\
             Respond as the coach. Keep it concise (2-3 sentences). Bring the \
             session to a clear close; end with certainty, not questions \
             (unless testing confidence)."
        }
    }
}

/// Build the confirmation prompt for a heuristically-due phase transition.
pub fn transition_prompt(ctx: &TurnContext, phase_turns: u32) -> String {
    let budgets = PhaseBudgets::calculate(ctx.max_turns);
    let recent = recent_history(&ctx.history, 6);

    format!(
        "Analyze the current coaching session state and decide whether it is \
         time to move to the next phase.\n\n\
         ### Current Phase\n{phase}\n\n\
         ### Session Budget\n\
         - Max turns: {max_turns}\n\
         - Current turn: {turn_count}\n\
         - Turns remaining: {remaining}\n\
         - Turns in current phase: {phase_turns}\n\
         - Exploration budget: {exploration} turns, Challenge budget: {challenge} turns\n\n\
         ### Recent Conversation\n{recent}\n\n\
         ### Observations Collected\n{observations}\n\n\
         ### Criteria\n\
         framing -> exploration: pattern identified, a concrete example given.\n\
         exploration -> challenge: core resistance or fear surfaced.\n\
         challenge -> synthesis: a specific commitment articulated.\n\
         synthesis -> end: commitment confirmed, natural close reached.\n\n\
         ### Output\n\
         Return JSON only:\n\
         {{\"should_transition\": true, \"next_phase\": \"exploration\", \"reasoning\": \"...\"}}",
        phase = ctx.phase,
        max_turns = ctx.max_turns,
        turn_count = ctx.turn_count,
        remaining = ctx.turns_remaining(),
        phase_turns = phase_turns,
        exploration = budgets.exploration,
        challenge = budgets.challenge,
        recent = format_history(recent),
        observations = or_none(&ctx.observations),
    )
}

/// Observations-only extraction, used during exploration.
pub fn observation_prompt(recent_text: &str, observations: &str) -> String {
    format!(
        "Analyze these recent coaching messages and identify any new \
         observations about the learner.\n\n\
         ### Recent Messages\n{recent_text}\n\n\
         ### Existing Observations\n{}\n\n\
         ### Task\n\
         Briefly note any NEW patterns, fears, beliefs, or strengths revealed \
         in this exchange. Keep it concise (1-3 sentences). If nothing new, \
         return the existing observations.\n\n\
         ### Response\n\
         Return only the updated observations text (no JSON, no formatting):",
        or_none(observations),
    )
}

/// Full extraction (observations + commitment + key insight), used during
/// challenge where commitments surface.
pub fn insight_prompt(
    recent_text: &str,
    observations: &str,
    commitment: &str,
    key_insight: &str,
) -> String {
    format!(
        "Analyze these recent coaching messages and extract insights.\n\n\
         ### Recent Messages\n{recent_text}\n\n\
         ### Existing State\n\
         Observations: {}\n\
         Commitment: {}\n\
         Key Insight: {}\n\n\
         ### Task\n\
         1. observations: note any NEW patterns, fears, beliefs, or strengths \
         revealed (1-3 sentences), building on the existing observations.\n\
         2. commitment: if the user made a specific commitment (action + \
         timeframe), capture it verbatim; look for \"I will...\", \"I commit \
         to...\". Otherwise return the existing one or an empty string.\n\
         3. key_insight: if there was an aha moment or core realization, \
         capture it. Otherwise return the existing one or an empty string.\n\n\
         ### Response Format\n\
         Return JSON only (no markdown, no explanation):\n\
         {{\"observations\": \"...\", \"commitment\": \"...\", \"key_insight\": \"...\"}}",
        or_none(observations),
        or_none(commitment),
        or_none(key_insight),
    )
}

/// Build the post-session reflection prompt from the full transcript.
pub fn reflection_prompt(transcript: &str) -> String {
    format!(
        "You are analyzing a completed coaching session to generate a \
         reflection for tracking the learner's progress over time.\n\n\
         ### Session Transcript\n{transcript}\n\n\
         ### Task\n\
         1. key_observations: 1-2 paragraphs of flowing prose (no bullet \
         points) covering emotional patterns, cognitive habits, limiting \
         beliefs, and strengths you observed. Be descriptive, not judgmental; \
         use their exact language where powerful.\n\
         2. outcome_classification: exactly one of:\n\
            - \"breakthrough_achieved\": genuine insight AND a specific \
         behavioral commitment.\n\
            - \"partial_progress\": increased awareness, but resistance or \
         gaps remain.\n\
            - \"root_cause_identified\": a deeper underlying issue was \
         uncovered that needs targeted follow-up.\n\
         Be honest, not optimistic: breakthrough requires a concrete \
         commitment, not just insight.\n\
         3. insights_summary: 2-3 sentences on the core discovery and what \
         changed from start to finish.\n\
         4. commitment: the specific commitment (what + when), or null.\n\
         5. suggested_followup: one sentence on what future coaching could \
         address, or null.\n\n\
         ### Output Format\n\
         Return valid JSON:\n\
         ```json\n\
         {{\n\
           \"key_observations\": \"...\",\n\
           \"outcome_classification\": \"partial_progress\",\n\
           \"insights_summary\": \"...\",\n\
           \"commitment\": null,\n\
           \"suggested_followup\": null\n\
         }}\n\
         ```",
    )
}

/// Last `count` messages of the history.
fn recent_history(messages: &[ChatMessage], count: usize) -> &[ChatMessage] {
    let start = messages.len().saturating_sub(count);
    &messages[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;
    use std::collections::BTreeMap;

    fn context_in(phase: Phase) -> TurnContext {
        TurnContext {
            session_id: "s-1".into(),
            phase,
            entered_phase: phase,
            turn_count: 3,
            max_turns: 12,
            phase_turns: BTreeMap::new(),
            history: vec![
                ChatMessage {
                    role: Role::User,
                    content: "I keep putting off hard conversations.".into(),
                },
                ChatMessage {
                    role: Role::Coach,
                    content: "When did that last happen?".into(),
                },
            ],
            input: "Yesterday, with my manager.".into(),
            reply: String::new(),
            observations: "Avoids conflict.".into(),
            commitment: String::new(),
            key_insight: String::new(),
            end_requested: false,
            should_end: false,
        }
    }

    #[test]
    fn test_format_history_empty_placeholder() {
        assert_eq!(format_history(&[]), "(No messages yet)");
    }

    #[test]
    fn test_format_history_roles_uppercased() {
        let ctx = context_in(Phase::Framing);
        let history = format_history(&ctx.history);
        assert!(history.starts_with("USER: I keep putting off"));
        assert!(history.contains("COACH: When did that last happen?"));
    }

    #[test]
    fn test_phase_prompt_carries_budget_and_input() {
        let ctx = context_in(Phase::Exploration);
        let prompt = phase_prompt(&ctx);
        assert!(prompt.contains("Current Phase: EXPLORATION"));
        assert!(prompt.contains("Total turns available: 12"));
        assert!(prompt.contains("Observations so far: Avoids conflict."));
        assert!(prompt.contains("Yesterday, with my manager."));
    }

    #[test]
    fn test_synthesis_prompt_includes_commitment_context() {
        let mut ctx = context_in(Phase::Synthesis);
        ctx.commitment = "Raise the issue on Friday.".into();
        let prompt = phase_prompt(&ctx);
        assert!(prompt.contains("Commitment identified: Raise the issue on Friday."));
        assert!(prompt.contains("Key insight: (None yet)"));
    }

    #[test]
    fn test_transition_prompt_mentions_phase_and_format() {
        let ctx = context_in(Phase::Exploration);
        let prompt = transition_prompt(&ctx, 2);
        assert!(prompt.contains("exploration"));
        assert!(prompt.contains("should_transition"));
        assert!(prompt.contains("Turns in current phase: 2"));
    }

    #[test]
    fn test_reflection_prompt_embeds_transcript() {
        let prompt = reflection_prompt("USER: hello\n\nCOACH: hi");
        assert!(prompt.contains("USER: hello"));
        assert!(prompt.contains("outcome_classification"));
        assert!(prompt.contains("breakthrough_achieved"));
    }

    #[test]
    fn test_recent_history_bounds() {
        let ctx = context_in(Phase::Framing);
        assert_eq!(recent_history(&ctx.history, 6).len(), 2);
        assert_eq!(recent_history(&ctx.history, 1).len(), 1);
    }
}
