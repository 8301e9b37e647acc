//! Session-level orchestration over the store and the model.
//!
//! Owns the read-pipeline-write cycle for each operation and the
//! per-session locks that serialize concurrent turns. The accumulated-state
//! read-modify-write across respond -> commit is not atomic against a second
//! in-flight turn, so turns for one session take the session's lock for
//! their full duration; distinct sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::error::CoachError;
use crate::llm::CoachModel;
use crate::store::{
    DbHandle, MessageRecord, NewMessage, ReflectionRecord, Role, SessionRecord, SessionStatus,
    TurnCommit,
};

use super::prompts;
use super::reflection::ReflectionSynthesizer;
use super::turn::{ChatMessage, TurnContext, TurnPipeline};

/// Result of a processed turn, for the transport layer.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    pub phase: crate::phase::Phase,
    pub turn_count: u32,
    pub turns_remaining: u32,
    pub session_complete: bool,
}

pub struct CoachingService {
    db: DbHandle,
    model: Arc<dyn CoachModel>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CoachingService {
    pub fn new(db: DbHandle, model: Arc<dyn CoachModel>) -> Self {
        Self {
            db,
            model,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The lock serializing turns for one session.
    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_session(&self, session_id: &str) -> Result<SessionRecord, CoachError> {
        let id = session_id.to_string();
        self.db
            .call(move |db| db.get_session(&id))
            .await?
            .ok_or_else(|| CoachError::SessionNotFound(session_id.to_string()))
    }

    fn require_active(session: &SessionRecord, action: &'static str) -> Result<(), CoachError> {
        if session.status != SessionStatus::Active {
            return Err(CoachError::InvalidState {
                id: session.id.clone(),
                status: session.status.as_str().to_string(),
                action,
            });
        }
        Ok(())
    }

    /// Create a session and generate the opening coach message.
    ///
    /// A provided topic is stored as the turn-0 user message so later turns
    /// keep it in conversation history.
    pub async fn start_session(
        &self,
        topic: Option<String>,
        max_turns: u32,
    ) -> Result<(SessionRecord, String), CoachError> {
        let create_topic = topic.clone();
        let session = self
            .db
            .call(move |db| db.create_session(create_topic.as_deref(), max_turns))
            .await?;
        info!(session = %session.id, max_turns, "Session started");

        let mut history = Vec::new();
        if let Some(topic_text) = topic.clone() {
            let session_id = session.id.clone();
            let message = NewMessage {
                role: Role::User,
                content: topic_text.clone(),
                phase: session.phase,
                turn_number: 0,
            };
            self.db
                .call(move |db| db.insert_message(&session_id, &message))
                .await?;
            history.push(ChatMessage {
                role: Role::User,
                content: topic_text,
            });
        }

        let ctx = TurnContext::from_session(
            &session,
            history,
            topic.unwrap_or_default(),
            false,
        );
        let opening = self
            .model
            .complete(Some(prompts::SYSTEM_PROMPT), &prompts::phase_prompt(&ctx))
            .await
            .map_err(CoachError::Model)?;

        let session_id = session.id.clone();
        let message = NewMessage {
            role: Role::Coach,
            content: opening.clone(),
            phase: session.phase,
            turn_number: 0,
        };
        self.db
            .call(move |db| db.insert_message(&session_id, &message))
            .await?;

        Ok((session, opening))
    }

    /// Run one turn of the conversation.
    pub async fn process_message(
        &self,
        session_id: &str,
        content: String,
        request_end: bool,
    ) -> Result<TurnOutcome, CoachError> {
        if content.trim().is_empty() {
            return Err(CoachError::InvalidInput(
                "Message content cannot be empty".into(),
            ));
        }

        let lock = self.session_lock(session_id).await;
        let _turn = lock.lock().await;

        let session = self.load_session(session_id).await?;
        Self::require_active(&session, "send messages")?;
        if session.turn_count >= session.max_turns {
            return Err(CoachError::TurnsExhausted(session.id));
        }

        let history = self.history(session_id).await?;
        let ctx = TurnContext::from_session(&session, history, content.clone(), request_end);

        let pipeline = TurnPipeline::new(self.model.as_ref());
        let turned = pipeline.run(ctx).await.map_err(CoachError::Model)?;

        let turn_number = turned.turn_count;
        let commit = TurnCommit {
            session_id: session.id.clone(),
            phase: turned.phase,
            turn_count: turned.turn_count,
            phase_turns: turned.phase_turns.clone(),
            observations: turned.observations.clone(),
            commitment: turned.commitment.clone(),
            key_insight: turned.key_insight.clone(),
            user_message: NewMessage {
                role: Role::User,
                content,
                phase: turned.entered_phase,
                turn_number,
            },
            coach_message: NewMessage {
                role: Role::Coach,
                content: turned.reply.clone(),
                phase: turned.phase,
                turn_number,
            },
        };
        let updated = self.db.call(move |db| db.commit_turn(&commit)).await?;
        info!(
            session = %updated.id,
            turn = updated.turn_count,
            phase = %updated.phase,
            "Turn committed"
        );

        Ok(TurnOutcome {
            content: turned.reply,
            phase: updated.phase,
            turn_count: updated.turn_count,
            turns_remaining: updated.turns_remaining(),
            session_complete: turned.should_end,
        })
    }

    /// End a session: synthesize (or re-fetch) the reflection and mark the
    /// session completed.
    ///
    /// Idempotent: ending an already-completed session returns the stored
    /// reflection unchanged.
    pub async fn end_session(
        &self,
        session_id: &str,
    ) -> Result<(SessionRecord, ReflectionRecord), CoachError> {
        let lock = self.session_lock(session_id).await;
        let _turn = lock.lock().await;

        let session = self.load_session(session_id).await?;

        if session.status == SessionStatus::Completed {
            let id = session_id.to_string();
            let existing = self.db.call(move |db| db.get_reflection(&id)).await?;
            if let Some(reflection) = existing {
                return Ok((session, reflection));
            }
        }
        Self::require_active(&session, "end the session")?;

        // A reflection may already exist even for an active session if a
        // previous end attempt died between the insert and the status flip.
        let id = session_id.to_string();
        let existing = self.db.call(move |db| db.get_reflection(&id)).await?;
        let reflection = match existing {
            Some(reflection) => reflection,
            None => {
                let history = self.history(session_id).await?;
                let transcript = prompts::format_history(&history);
                let synthesized = ReflectionSynthesizer::new(self.model.as_ref())
                    .synthesize(&transcript)
                    .await;

                let id = session_id.to_string();
                self.db
                    .call(move |db| {
                        db.insert_reflection(
                            &id,
                            &synthesized.observations,
                            synthesized.outcome,
                            &synthesized.insights,
                            synthesized.commitment.as_deref(),
                            synthesized.suggested_followup.as_deref(),
                        )
                    })
                    .await?
            }
        };

        let id = session_id.to_string();
        let ended = self
            .db
            .call(move |db| db.end_session(&id, SessionStatus::Completed))
            .await?;
        info!(session = %ended.id, outcome = %reflection.outcome.as_str(), "Session ended");

        Ok((ended, reflection))
    }

    /// Full session detail: record, ordered messages, reflection if any.
    pub async fn session_detail(
        &self,
        session_id: &str,
    ) -> Result<(SessionRecord, Vec<MessageRecord>, Option<ReflectionRecord>), CoachError> {
        let session = self.load_session(session_id).await?;
        let id = session_id.to_string();
        let messages = self.db.call(move |db| db.session_messages(&id)).await?;
        let id = session_id.to_string();
        let reflection = self.db.call(move |db| db.get_reflection(&id)).await?;
        Ok((session, messages, reflection))
    }

    /// The stored reflection for a completed session.
    pub async fn reflection(&self, session_id: &str) -> Result<ReflectionRecord, CoachError> {
        let session = self.load_session(session_id).await?;
        if session.status != SessionStatus::Completed {
            return Err(CoachError::InvalidState {
                id: session.id,
                status: session.status.as_str().to_string(),
                action: "fetch the reflection before the session has ended",
            });
        }
        let id = session_id.to_string();
        self.db
            .call(move |db| db.get_reflection(&id))
            .await?
            .ok_or_else(|| CoachError::ReflectionNotFound(session_id.to_string()))
    }

    async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>, CoachError> {
        let id = session_id.to_string();
        let messages = self.db.call(move |db| db.session_messages(&id)).await?;
        Ok(messages
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }
}
