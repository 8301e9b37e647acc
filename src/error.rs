//! Domain error taxonomy.
//!
//! Fatal turn errors (`Model` during respond) abort the pipeline before
//! anything is committed; degradable judgment failures never reach this
//! type — they are absorbed at the call site with the prior value.

use thiserror::Error;

use crate::llm::ModelError;

#[derive(Debug, Error)]
pub enum CoachError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Reflection not found for session {0}")]
    ReflectionNotFound(String),

    #[error("Session {id} is {status}, cannot {action}")]
    InvalidState {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("Session {0} has used its full turn budget; end the session to receive the reflection")]
    TurnsExhausted(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Reply generation failed: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
