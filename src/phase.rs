//! Coaching phase model and per-phase turn budgets.
//!
//! A session moves through four fixed phases in order. Transitions are
//! forward-only; the only jump allowed is directly to `Synthesis` when the
//! turn budget is nearly exhausted or the learner asks to wrap up.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the four fixed coaching stages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Framing,
    Exploration,
    Challenge,
    Synthesis,
}

impl Phase {
    /// All phases in session order.
    pub const ALL: [Phase; 4] = [
        Phase::Framing,
        Phase::Exploration,
        Phase::Challenge,
        Phase::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Framing => "framing",
            Self::Exploration => "exploration",
            Self::Challenge => "challenge",
            Self::Synthesis => "synthesis",
        }
    }

    /// The immediate successor phase, or `None` after `Synthesis`.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::Framing => Some(Self::Exploration),
            Self::Exploration => Some(Self::Challenge),
            Self::Challenge => Some(Self::Synthesis),
            Self::Synthesis => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "framing" => Ok(Self::Framing),
            "exploration" => Ok(Self::Exploration),
            "challenge" => Ok(Self::Challenge),
            "synthesis" => Ok(Self::Synthesis),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Turn budget allocated to each phase.
///
/// Invariant: `total() <= max_turns` for every input the calculator accepts.
/// Callers size their pacing against these numbers, so overselling even by
/// one turn is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseBudgets {
    pub framing: u32,
    pub exploration: u32,
    pub challenge: u32,
    pub synthesis: u32,
}

impl PhaseBudgets {
    /// Allocate per-phase budgets for a session of `max_turns` total turns.
    ///
    /// Sessions shorter than four turns use a fixed table that favors
    /// framing and the two working phases over synthesis. Longer sessions
    /// reserve up to 2 turns for framing and 3 for synthesis, splitting the
    /// remainder evenly between exploration and challenge with a floor of
    /// one turn each. If the floors push the sum past `max_turns` at small
    /// boundary values, exploration shrinks first, then challenge.
    pub fn calculate(max_turns: u32) -> Self {
        match max_turns {
            0 | 1 => {
                return Self {
                    framing: 1,
                    exploration: 0,
                    challenge: 0,
                    synthesis: 0,
                };
            }
            2 => {
                return Self {
                    framing: 1,
                    exploration: 1,
                    challenge: 0,
                    synthesis: 0,
                };
            }
            3 => {
                return Self {
                    framing: 1,
                    exploration: 1,
                    challenge: 1,
                    synthesis: 0,
                };
            }
            _ => {}
        }

        let framing = 2.min(max_turns / 4).max(1);
        let synthesis = 3.min(max_turns / 4).max(1);

        let variable = max_turns - framing - synthesis;
        let mut exploration = (variable / 2).max(1);
        let mut challenge = (variable - variable / 2).max(1);

        // The floors can oversell at small boundary values; shrink the
        // variable phases (exploration first) until the sum fits.
        let mut total = framing + exploration + challenge + synthesis;
        if total > max_turns {
            let reduce = (total - max_turns).min(exploration - 1);
            exploration -= reduce;
            total -= reduce;
        }
        if total > max_turns {
            challenge -= (total - max_turns).min(challenge - 1);
        }

        Self {
            framing,
            exploration,
            challenge,
            synthesis,
        }
    }

    /// Budget for a single phase.
    pub fn for_phase(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Framing => self.framing,
            Phase::Exploration => self.exploration,
            Phase::Challenge => self.challenge,
            Phase::Synthesis => self.synthesis,
        }
    }

    pub fn total(&self) -> u32 {
        self.framing + self.exploration + self.challenge + self.synthesis
    }
}
