//! SQLite database holding durable orchestration state.
//!
//! Holds the task store, the idempotency ledger, the per-repository poll
//! cursors and the append-only transition log. Everything the scheduler
//! needs to resume after a restart lives here.

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default database path: `~/.sdlc-orch/orchestrator.db`
pub fn default_path() -> anyhow::Result<PathBuf> {
    Ok(crate::home::orch_home()?.join("orchestrator.db"))
}

/// Database handle with async-safe locking.
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open(path: &PathBuf) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database: {}", path.display()))?;

        // WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database.
    #[cfg(test)]
    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        // WAL is a no-op for :memory:, only set busy_timeout
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run schema migrations.
    ///
    /// Uses `PRAGMA user_version` to track schema version and skip
    /// already-applied migrations on existing databases.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(SCHEMA_V1)?;
            conn.pragma_update(None, "user_version", 1)?;
        }

        Ok(())
    }

    /// Get a reference to the connection (for running queries).
    pub async fn conn(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Timestamps are stored as fixed-width RFC 3339 so that text ordering
/// matches time ordering and values round-trip exactly.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

/// Schema v1: tasks, ledger, cursors, transition log.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    repo              TEXT NOT NULL,
    number            INTEGER NOT NULL,
    title             TEXT NOT NULL DEFAULT '',
    phase             TEXT NOT NULL,
    plan_iterations   INTEGER NOT NULL DEFAULT 0,
    review_iterations INTEGER NOT NULL DEFAULT 0,
    dev_iterations    INTEGER NOT NULL DEFAULT 0,
    last_event_at     TEXT,
    last_event_id     TEXT,
    labels            TEXT NOT NULL DEFAULT '[]',
    ci_status         TEXT NOT NULL DEFAULT 'unknown',
    pr_number         INTEGER,
    head_sha          TEXT,
    branch            TEXT,
    plan              TEXT,
    feedback          TEXT NOT NULL DEFAULT '[]',
    pending_role      TEXT,
    pending_note      TEXT,
    superseded        INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    PRIMARY KEY (repo, number)
);

CREATE TABLE IF NOT EXISTS processed_events (
    repo          TEXT NOT NULL,
    number        INTEGER NOT NULL,
    event_id      TEXT NOT NULL,
    processed_at  TEXT NOT NULL,
    PRIMARY KEY (repo, number, event_id)
);

CREATE TABLE IF NOT EXISTS cursors (
    repo        TEXT PRIMARY KEY,
    cursor      TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    repo        TEXT NOT NULL,
    number      INTEGER NOT NULL,
    from_phase  TEXT NOT NULL,
    to_phase    TEXT NOT NULL,
    reason      TEXT NOT NULL DEFAULT '',
    at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_phase ON tasks(phase);
CREATE INDEX IF NOT EXISTS idx_tasks_pending ON tasks(pending_role);
CREATE INDEX IF NOT EXISTS idx_transitions_task ON transitions(repo, number);
"#;
