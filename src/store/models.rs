//! Persistent record types for sessions, messages, and reflections.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::phase::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Coach,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Coach => "coach",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "coach" => Ok(Self::Coach),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// Reflection outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    BreakthroughAchieved,
    PartialProgress,
    RootCauseIdentified,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BreakthroughAchieved => "breakthrough_achieved",
            Self::PartialProgress => "partial_progress",
            Self::RootCauseIdentified => "root_cause_identified",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breakthrough_achieved" => Ok(Self::BreakthroughAchieved),
            "partial_progress" => Ok(Self::PartialProgress),
            "root_cause_identified" => Ok(Self::RootCauseIdentified),
            _ => Err(format!("Invalid outcome classification: {}", s)),
        }
    }
}

/// A coaching session row — the single source of truth for cross-turn
/// continuity. Rehydrated into an ephemeral turn context for each inbound
/// message and written back in one transaction per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub topic: Option<String>,
    pub phase: Phase,
    pub turn_count: u32,
    pub max_turns: u32,
    /// Turns spent in each phase. Invariant: values sum to `turn_count`.
    pub phase_turns: BTreeMap<Phase, u32>,
    pub status: SessionStatus,
    pub observations: String,
    pub commitment: String,
    pub key_insight: String,
    pub created_at: String,
    pub ended_at: Option<String>,
}

impl SessionRecord {
    pub fn turns_remaining(&self) -> u32 {
        self.max_turns.saturating_sub(self.turn_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Phase the session was in when this message was created.
    pub phase: Phase,
    /// Shared by the user/coach pair produced in one pipeline run.
    pub turn_number: u32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub id: String,
    pub session_id: String,
    pub observations: String,
    pub outcome: Outcome,
    pub insights: String,
    pub commitment: Option<String>,
    pub suggested_followup: Option<String>,
    pub created_at: String,
}

/// One message to append as part of a turn commit.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub phase: Phase,
    pub turn_number: u32,
}

/// Everything a completed pipeline run writes back, applied atomically:
/// the session row update plus the user/coach message pair.
#[derive(Debug, Clone)]
pub struct TurnCommit {
    pub session_id: String,
    pub phase: Phase,
    pub turn_count: u32,
    pub phase_turns: BTreeMap<Phase, u32>,
    pub observations: String,
    pub commitment: String,
    pub key_insight: String,
    pub user_message: NewMessage,
    pub coach_message: NewMessage,
}
