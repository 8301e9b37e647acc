use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;
use crate::phase::Phase;

/// Async-safe handle to the session database.
///
/// Wraps `CoachDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CoachDb>>,
}

impl DbHandle {
    pub fn new(db: CoachDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CoachDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct CoachDb {
    conn: Connection,
}

impl CoachDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    topic TEXT,
                    phase TEXT NOT NULL DEFAULT 'framing',
                    turn_count INTEGER NOT NULL DEFAULT 0,
                    max_turns INTEGER NOT NULL DEFAULT 12,
                    framing_turns INTEGER NOT NULL DEFAULT 0,
                    exploration_turns INTEGER NOT NULL DEFAULT 0,
                    challenge_turns INTEGER NOT NULL DEFAULT 0,
                    synthesis_turns INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'active',
                    observations TEXT NOT NULL DEFAULT '',
                    commitment TEXT NOT NULL DEFAULT '',
                    key_insight TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    turn_number INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS reflections (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL UNIQUE REFERENCES sessions(id) ON DELETE CASCADE,
                    observations TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    insights TEXT NOT NULL,
                    commitment TEXT,
                    suggested_followup TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_session
                    ON messages(session_id, turn_number);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Session CRUD ──────────────────────────────────────────────────

    pub fn create_session(&self, topic: Option<&str>, max_turns: u32) -> Result<SessionRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sessions (id, topic, max_turns, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, topic, max_turns, created_at],
            )
            .context("Failed to insert session")?;
        self.get_session(&id)?
            .context("Session not found after insert")
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, topic, phase, turn_count, max_turns,
                        framing_turns, exploration_turns, challenge_turns, synthesis_turns,
                        status, observations, commitment, key_insight, created_at, ended_at
                 FROM sessions WHERE id = ?1",
            )
            .context("Failed to prepare get_session")?;
        let row = stmt
            .query_row(params![id], |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    topic: row.get(1)?,
                    phase: row.get(2)?,
                    turn_count: row.get(3)?,
                    max_turns: row.get(4)?,
                    framing_turns: row.get(5)?,
                    exploration_turns: row.get(6)?,
                    challenge_turns: row.get(7)?,
                    synthesis_turns: row.get(8)?,
                    status: row.get(9)?,
                    observations: row.get(10)?,
                    commitment: row.get(11)?,
                    key_insight: row.get(12)?,
                    created_at: row.get(13)?,
                    ended_at: row.get(14)?,
                })
            })
            .optional()
            .context("Failed to query session")?;
        row.map(SessionRow::into_record).transpose()
    }

    /// Apply a finished turn in one transaction: the session row update plus
    /// both message rows. Either everything lands or nothing does.
    pub fn commit_turn(&self, commit: &TurnCommit) -> Result<SessionRecord> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin turn transaction")?;

        let counter = |phase: Phase| commit.phase_turns.get(&phase).copied().unwrap_or(0);
        let updated = tx
            .execute(
                "UPDATE sessions SET
                     phase = ?1, turn_count = ?2,
                     framing_turns = ?3, exploration_turns = ?4,
                     challenge_turns = ?5, synthesis_turns = ?6,
                     observations = ?7, commitment = ?8, key_insight = ?9
                 WHERE id = ?10",
                params![
                    commit.phase.as_str(),
                    commit.turn_count,
                    counter(Phase::Framing),
                    counter(Phase::Exploration),
                    counter(Phase::Challenge),
                    counter(Phase::Synthesis),
                    commit.observations,
                    commit.commitment,
                    commit.key_insight,
                    commit.session_id,
                ],
            )
            .context("Failed to update session for turn")?;
        if updated == 0 {
            anyhow::bail!("Session {} not found during turn commit", commit.session_id);
        }

        for message in [&commit.user_message, &commit.coach_message] {
            tx.execute(
                "INSERT INTO messages (id, session_id, role, content, phase, turn_number, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    commit.session_id,
                    message.role.as_str(),
                    message.content,
                    message.phase.as_str(),
                    message.turn_number,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert turn message")?;
        }

        tx.commit().context("Failed to commit turn")?;
        self.get_session(&commit.session_id)?
            .context("Session not found after turn commit")
    }

    pub fn end_session(&self, id: &str, status: SessionStatus) -> Result<SessionRecord> {
        self.conn
            .execute(
                "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )
            .context("Failed to end session")?;
        self.get_session(id)?
            .context("Session not found after end update")
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn insert_message(&self, session_id: &str, message: &NewMessage) -> Result<MessageRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO messages (id, session_id, role, content, phase, turn_number, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    session_id,
                    message.role.as_str(),
                    message.content,
                    message.phase.as_str(),
                    message.turn_number,
                    created_at,
                ],
            )
            .context("Failed to insert message")?;
        Ok(MessageRecord {
            id,
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            phase: message.phase,
            turn_number: message.turn_number,
            created_at,
        })
    }

    /// All messages for a session in conversation order.
    pub fn session_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, role, content, phase, turn_number, created_at
                 FROM messages WHERE session_id = ?1
                 ORDER BY turn_number, created_at",
            )
            .context("Failed to prepare session_messages")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    phase: row.get(4)?,
                    turn_number: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?.into_record()?);
        }
        Ok(messages)
    }

    // ── Reflections ───────────────────────────────────────────────────

    pub fn insert_reflection(
        &self,
        session_id: &str,
        observations: &str,
        outcome: Outcome,
        insights: &str,
        commitment: Option<&str>,
        suggested_followup: Option<&str>,
    ) -> Result<ReflectionRecord> {
        self.conn
            .execute(
                "INSERT INTO reflections
                     (id, session_id, observations, outcome, insights, commitment, suggested_followup, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    session_id,
                    observations,
                    outcome.as_str(),
                    insights,
                    commitment,
                    suggested_followup,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert reflection")?;
        self.get_reflection(session_id)?
            .context("Reflection not found after insert")
    }

    pub fn get_reflection(&self, session_id: &str) -> Result<Option<ReflectionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, observations, outcome, insights, commitment, suggested_followup, created_at
                 FROM reflections WHERE session_id = ?1",
            )
            .context("Failed to prepare get_reflection")?;
        let row = stmt
            .query_row(params![session_id], |row| {
                Ok(ReflectionRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    observations: row.get(2)?,
                    outcome: row.get(3)?,
                    insights: row.get(4)?,
                    commitment: row.get(5)?,
                    suggested_followup: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .optional()
            .context("Failed to query reflection")?;
        row.map(ReflectionRow::into_record).transpose()
    }
}

// ── Row types (raw TEXT columns parsed into enums after the query) ────

struct SessionRow {
    id: String,
    topic: Option<String>,
    phase: String,
    turn_count: u32,
    max_turns: u32,
    framing_turns: u32,
    exploration_turns: u32,
    challenge_turns: u32,
    synthesis_turns: u32,
    status: String,
    observations: String,
    commitment: String,
    key_insight: String,
    created_at: String,
    ended_at: Option<String>,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        let phase = Phase::from_str(&self.phase)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid phase column")?;
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid status column")?;
        let phase_turns = BTreeMap::from([
            (Phase::Framing, self.framing_turns),
            (Phase::Exploration, self.exploration_turns),
            (Phase::Challenge, self.challenge_turns),
            (Phase::Synthesis, self.synthesis_turns),
        ]);
        Ok(SessionRecord {
            id: self.id,
            topic: self.topic,
            phase,
            turn_count: self.turn_count,
            max_turns: self.max_turns,
            phase_turns,
            status,
            observations: self.observations,
            commitment: self.commitment,
            key_insight: self.key_insight,
            created_at: self.created_at,
            ended_at: self.ended_at,
        })
    }
}

struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    phase: String,
    turn_number: u32,
    created_at: String,
}

impl MessageRow {
    fn into_record(self) -> Result<MessageRecord> {
        Ok(MessageRecord {
            role: Role::from_str(&self.role)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid role column")?,
            phase: Phase::from_str(&self.phase)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid phase column")?,
            id: self.id,
            session_id: self.session_id,
            content: self.content,
            turn_number: self.turn_number,
            created_at: self.created_at,
        })
    }
}

struct ReflectionRow {
    id: String,
    session_id: String,
    observations: String,
    outcome: String,
    insights: String,
    commitment: Option<String>,
    suggested_followup: Option<String>,
    created_at: String,
}

impl ReflectionRow {
    fn into_record(self) -> Result<ReflectionRecord> {
        Ok(ReflectionRecord {
            outcome: Outcome::from_str(&self.outcome)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid outcome column")?,
            id: self.id,
            session_id: self.session_id,
            observations: self.observations,
            insights: self.insights,
            commitment: self.commitment,
            suggested_followup: self.suggested_followup,
            created_at: self.created_at,
        })
    }
}
