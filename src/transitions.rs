//! Phase transition rules.
//!
//! Transition decisions are two-tier: a pure heuristic over turn counters
//! and qualitative signals decides whether a move is *due*, and an optional
//! model confirmation can veto it. `resolve` combines the two so the policy
//! is testable without any model in the loop.

use serde::Deserialize;

use crate::phase::{Phase, PhaseBudgets};

/// Qualitative signals observed in the conversation so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionSignals {
    /// The learner has given at least one concrete example or situation.
    pub concrete_example: bool,
    /// A resistance, fear, or limiting belief has been surfaced.
    pub resistance_surfaced: bool,
    /// A specific commitment has been articulated.
    pub commitment_made: bool,
    /// The learner asked to wrap the session up early.
    pub user_requested_end: bool,
}

/// Outcome of a transition check.
///
/// `next_phase == None` together with `should_transition == true` means the
/// session has nothing left after the current phase: end it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionDecision {
    pub should_transition: bool,
    pub next_phase: Option<Phase>,
    pub reasoning: String,
}

impl TransitionDecision {
    fn advance(next_phase: Option<Phase>, reasoning: impl Into<String>) -> Self {
        Self {
            should_transition: true,
            next_phase,
            reasoning: reasoning.into(),
        }
    }

    fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            should_transition: false,
            next_phase: None,
            reasoning: reasoning.into(),
        }
    }
}

/// Whether the remaining turn budget forces a jump straight to synthesis.
///
/// The last two turns of every session are reserved for closing, no matter
/// what the qualitative signals say.
pub fn force_synthesis(turn_count: u32, max_turns: u32) -> bool {
    turn_count >= max_turns.saturating_sub(2)
}

/// Heuristic transition check for the current phase.
///
/// Rule precedence: an early-end request beats everything; otherwise each
/// phase advances once its budget is spent or its phase-specific signal
/// fires (exploration additionally requires two turns of depth before a
/// resistance signal can advance it).
pub fn evaluate(
    current_phase: Phase,
    turn_count: u32,
    max_turns: u32,
    phase_turns: u32,
    signals: TransitionSignals,
) -> TransitionDecision {
    let budgets = PhaseBudgets::calculate(max_turns);
    let turns_remaining = max_turns.saturating_sub(turn_count);

    if signals.user_requested_end {
        return TransitionDecision::advance(
            Some(Phase::Synthesis),
            "User requested to end the session early",
        );
    }

    match current_phase {
        Phase::Framing => {
            if phase_turns >= budgets.framing || signals.concrete_example {
                return TransitionDecision::advance(
                    Some(Phase::Exploration),
                    "Framing complete - context established",
                );
            }
        }
        Phase::Exploration => {
            let budget_spent = phase_turns >= budgets.exploration;
            let ready = signals.resistance_surfaced && phase_turns >= 2;
            if budget_spent || ready {
                return TransitionDecision::advance(
                    Some(Phase::Challenge),
                    if ready {
                        "Exploration complete - resistance identified"
                    } else {
                        "Exploration budget exhausted"
                    },
                );
            }
        }
        Phase::Challenge => {
            if phase_turns >= budgets.challenge || signals.commitment_made {
                return TransitionDecision::advance(
                    Some(Phase::Synthesis),
                    if signals.commitment_made {
                        "Challenge complete - commitment secured"
                    } else {
                        "Challenge budget exhausted"
                    },
                );
            }
        }
        Phase::Synthesis => {
            if phase_turns >= budgets.synthesis || turns_remaining == 0 {
                return TransitionDecision::advance(None, "Session complete");
            }
        }
    }

    TransitionDecision::hold(format!("Continuing in {} phase", current_phase))
}

/// Confirmation verdict returned by the secondary model judgment.
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionConfirmation {
    pub should_transition: bool,
    #[serde(default)]
    pub next_phase: Option<String>,
}

/// Combine the heuristic decision with an optional confirmation verdict.
///
/// - No confirmation available (call failed, timed out, or unparseable):
///   trust the heuristic as-is.
/// - Confirmation declines: stay in the current phase.
/// - Confirmation agrees: transition. Its phase name is used when it parses
///   to a phase at or beyond the heuristic's target; anything else (unknown
///   name, regression) falls back to the heuristic's target.
pub fn resolve(
    heuristic: TransitionDecision,
    confirmation: Option<TransitionConfirmation>,
) -> TransitionDecision {
    if !heuristic.should_transition || heuristic.next_phase.is_none() {
        return heuristic;
    }

    let Some(confirmation) = confirmation else {
        return heuristic;
    };

    if !confirmation.should_transition {
        return TransitionDecision::hold("Confirmation declined the phase change");
    }

    let target = confirmation
        .next_phase
        .as_deref()
        .and_then(|name| name.parse::<Phase>().ok())
        .filter(|p| heuristic.next_phase.is_some_and(|h| *p >= h))
        .or(heuristic.next_phase);

    TransitionDecision {
        should_transition: true,
        next_phase: target,
        reasoning: heuristic.reasoning,
    }
}
