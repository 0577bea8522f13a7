//! Conversation log repository

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::params;

use super::DbPool;
use crate::pipeline::{ConversationSink, TurnOutcome, TurnSummary};
use crate::{Error, Result};

/// A stored turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub user_text: String,
    pub assistant_text: String,
    pub stt_provider: String,
    pub llm_provider: String,
    pub tts_provider: String,
    pub outcome: String,
    pub error: Option<String>,
    pub llm_first_ms: Option<i64>,
    pub llm_total_ms: Option<i64>,
    pub tts_ms: Option<i64>,
    pub first_audio_ms: Option<i64>,
    pub total_ms: Option<i64>,
    pub sentences: i64,
    pub audio_fragments: i64,
    pub failed_fragments: i64,
}

/// Conversation log repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Store a finished turn, returning its row id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, summary: &TurnSummary) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let timings = &summary.timings;
        let error = match &summary.outcome {
            TurnOutcome::Failed(error) => Some(error.as_str()),
            _ => None,
        };

        conn.execute(
            "INSERT INTO conversations (
                turn_id, timestamp, user_text, assistant_text,
                stt_provider, llm_provider, tts_provider, outcome, error,
                llm_first_ms, llm_total_ms, tts_ms, first_audio_ms, total_ms,
                sentences, audio_fragments, failed_fragments
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                summary.id.to_string(),
                summary.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                summary.user_text,
                summary.assistant_text,
                summary.providers.stt.as_deref().unwrap_or("text"),
                summary.providers.llm,
                summary.providers.tts,
                summary.outcome.as_str(),
                error,
                timings.first_token.map(millis),
                timings.generation.map(millis),
                millis(timings.synthesis),
                timings.first_audio.map(millis),
                millis(timings.total),
                to_i64(summary.sentences),
                to_i64(summary.audio_fragments),
                to_i64(summary.failed_fragments),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Most recent turns, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(&self, limit: usize) -> Result<Vec<ConversationEntry>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, user_text, assistant_text,
                    stt_provider, llm_provider, tts_provider, outcome, error,
                    llm_first_ms, llm_total_ms, tts_ms, first_audio_ms, total_ms,
                    sentences, audio_fragments, failed_fragments
             FROM conversations
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;

        let entries = stmt
            .query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok(ConversationEntry {
                    id: row.get(0)?,
                    timestamp: parse_timestamp(&row.get::<_, String>(1)?),
                    user_text: row.get(2)?,
                    assistant_text: row.get(3)?,
                    stt_provider: row.get(4)?,
                    llm_provider: row.get(5)?,
                    tts_provider: row.get(6)?,
                    outcome: row.get(7)?,
                    error: row.get(8)?,
                    llm_first_ms: row.get(9)?,
                    llm_total_ms: row.get(10)?,
                    tts_ms: row.get(11)?,
                    first_audio_ms: row.get(12)?,
                    total_ms: row.get(13)?,
                    sentences: row.get(14)?,
                    audio_fragments: row.get(15)?,
                    failed_fragments: row.get(16)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Number of stored turns
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl ConversationSink for ConversationRepo {
    fn record(&self, summary: &TurnSummary) -> Result<()> {
        let id = self.insert(summary)?;
        tracing::debug!(id, turn = %summary.id, "turn logged");
        Ok(())
    }
}

fn millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Parse `SQLite` `datetime('now')` format
fn parse_timestamp(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map_or_else(|_| Utc::now(), |dt| dt.and_utc())
}
