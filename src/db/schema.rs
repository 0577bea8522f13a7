//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- One row per finished turn
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL DEFAULT (datetime('now')),
            user_text TEXT NOT NULL,
            assistant_text TEXT NOT NULL,
            stt_provider TEXT NOT NULL,
            llm_provider TEXT NOT NULL,
            tts_provider TEXT NOT NULL,
            llm_first_ms INTEGER,
            llm_total_ms INTEGER,
            tts_ms INTEGER,
            total_ms INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_timestamp ON conversations(timestamp);

        PRAGMA user_version = 1;
        ",
    )?;

    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Turn outcome and fragment accounting
        ALTER TABLE conversations ADD COLUMN turn_id TEXT;
        ALTER TABLE conversations ADD COLUMN outcome TEXT NOT NULL DEFAULT 'completed';
        ALTER TABLE conversations ADD COLUMN error TEXT;
        ALTER TABLE conversations ADD COLUMN first_audio_ms INTEGER;
        ALTER TABLE conversations ADD COLUMN sentences INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE conversations ADD COLUMN audio_fragments INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE conversations ADD COLUMN failed_fragments INTEGER NOT NULL DEFAULT 0;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_turn ON conversations(turn_id);

        PRAGMA user_version = 2;
        ",
    )?;

    Ok(())
}
