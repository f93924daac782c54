//! Idempotency ledger and poll cursors.
//!
//! `(repo, number, event_id)` rows record which events have been applied to
//! which task. Marking is an `INSERT OR IGNORE`, so check-then-mark is a
//! single statement: the caller learns whether it was the first to mark.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use super::tasks::TaskRef;
use crate::db::{decode_ts, encode_ts, Db};

pub fn should_process_tx(conn: &Connection, task: &TaskRef, event_id: &str) -> anyhow::Result<bool> {
    let seen: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM processed_events WHERE repo = ?1 AND number = ?2 AND event_id = ?3",
            params![task.repo, task.number as i64, event_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seen.is_none())
}

/// Mark an event processed. Returns `false` when it already was.
pub fn mark_processed_tx(
    conn: &Connection,
    task: &TaskRef,
    event_id: &str,
    at: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO processed_events (repo, number, event_id, processed_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![task.repo, task.number as i64, event_id, encode_ts(&at)],
    )?;
    Ok(inserted == 1)
}

#[derive(Clone)]
pub struct Ledger {
    db: Arc<Db>,
}

impl Ledger {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub async fn should_process(&self, task: &TaskRef, event_id: &str) -> anyhow::Result<bool> {
        let conn = self.db.conn().await;
        should_process_tx(&conn, task, event_id)
    }

    /// Stored poll cursor of a repository, if it was ever polled.
    pub async fn cursor(&self, repo: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.db.conn().await;
        let raw: Option<String> = conn
            .query_row("SELECT cursor FROM cursors WHERE repo = ?1", params![repo], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(|r| decode_ts(&r)).transpose()?)
    }

    pub async fn store_cursor(&self, repo: &str, cursor: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO cursors (repo, cursor, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(repo) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
            params![repo, encode_ts(&cursor), encode_ts(&Utc::now())],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> Ledger {
        let db = Db::open_memory().unwrap();
        db.migrate().await.unwrap();
        Ledger::new(Arc::new(db))
    }

    async fn mark(ledger: &Ledger, task: &TaskRef, event_id: &str) -> bool {
        let conn = ledger.db.conn().await;
        mark_processed_tx(&conn, task, event_id, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn check_then_mark_is_once_per_key() {
        let ledger = ledger().await;
        let t = TaskRef::new("o/r", 42);
        assert!(ledger.should_process(&t, "ci:abc").await.unwrap());
        assert!(mark(&ledger, &t, "ci:abc").await);
        assert!(!ledger.should_process(&t, "ci:abc").await.unwrap());
        assert!(!mark(&ledger, &t, "ci:abc").await);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_task() {
        let ledger = ledger().await;
        mark(&ledger, &TaskRef::new("o/r", 1), "comment:9").await;
        assert!(ledger.should_process(&TaskRef::new("o/r", 2), "comment:9").await.unwrap());
        assert!(ledger.should_process(&TaskRef::new("o/other", 1), "comment:9").await.unwrap());
    }

    #[tokio::test]
    async fn cursor_round_trips_and_overwrites() {
        let ledger = ledger().await;
        assert!(ledger.cursor("o/r").await.unwrap().is_none());
        let first = Utc::now();
        ledger.store_cursor("o/r", first).await.unwrap();
        assert_eq!(ledger.cursor("o/r").await.unwrap(), Some(first));
        let later = first + chrono::Duration::seconds(30);
        ledger.store_cursor("o/r", later).await.unwrap();
        assert_eq!(ledger.cursor("o/r").await.unwrap(), Some(later));
    }
}
