//! Task model and the durable task store.
//!
//! A Task is the orchestration state of one issue (and its PR lineage).
//! Rows are never deleted. The `*_tx` functions run on a borrowed
//! connection so the scheduler can combine them with ledger writes in one
//! transaction; the async `TaskStore` methods are for read paths and the CLI.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::runner::AgentRole;
use crate::db::{decode_ts, encode_ts, Db};

/// Identity of a task: host repository plus issue number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    pub repo: String,
    pub number: u64,
}

impl TaskRef {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// SDLC phase of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    New,
    Planning,
    PlanReady,
    Coding,
    AwaitingCi,
    CiFailed,
    ReviewPending,
    ChangesRequested,
    Approved,
    ForcedApproved,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::New,
        Phase::Planning,
        Phase::PlanReady,
        Phase::Coding,
        Phase::AwaitingCi,
        Phase::CiFailed,
        Phase::ReviewPending,
        Phase::ChangesRequested,
        Phase::Approved,
        Phase::ForcedApproved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Planning => "planning",
            Self::PlanReady => "plan_ready",
            Self::Coding => "coding",
            Self::AwaitingCi => "awaiting_ci",
            Self::CiFailed => "ci_failed",
            Self::ReviewPending => "review_pending",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::ForcedApproved => "forced_approved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::ForcedApproved)
    }

    /// The issue label mirroring this phase, e.g. `sdlc:awaiting-ci`.
    pub fn label(&self) -> String {
        format!("{PHASE_LABEL_PREFIX}{}", self.as_str().replace('_', "-"))
    }
}

/// Prefix shared by all phase labels.
pub const PHASE_LABEL_PREFIX: &str = "sdlc:";

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == norm)
            .ok_or_else(|| anyhow::anyhow!("unknown phase: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
    Unknown,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "success" => Self::Success,
            "failure" => Self::Failure,
            _ => Self::Unknown,
        }
    }
}

/// Host-time position of an event; the per-task watermark.
///
/// Ordered by time, ties broken by event id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition {
    pub at: DateTime<Utc>,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_ref: TaskRef,
    pub title: String,
    pub phase: Phase,
    pub plan_iterations: u32,
    pub review_iterations: u32,
    pub dev_iterations: u32,
    /// Last processed event; anything at or before it is stale.
    pub watermark: Option<EventPosition>,
    pub labels: BTreeSet<String>,
    pub ci_status: CiStatus,
    pub pr_number: Option<u64>,
    pub head_sha: Option<String>,
    pub branch: Option<String>,
    pub plan: Option<String>,
    /// Blocking issues from the latest review, handed to the next coder run.
    pub feedback: Vec<String>,
    /// Agent dispatched but not yet finished. Set only while a run is in flight.
    pub pending_role: Option<AgentRole>,
    pub pending_note: Option<String>,
    /// A newer PR replaced the one the task was tracking.
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_ref: TaskRef, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_ref,
            title: title.into(),
            phase: Phase::New,
            plan_iterations: 0,
            review_iterations: 0,
            dev_iterations: 0,
            watermark: None,
            labels: BTreeSet::new(),
            ci_status: CiStatus::Unknown,
            pr_number: None,
            head_sha: None,
            branch: None,
            plan: None,
            feedback: Vec::new(),
            pending_role: None,
            pending_note: None,
            superseded: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether an event at `pos` is at or before the watermark.
    pub fn is_stale(&self, pos: &EventPosition) -> bool {
        self.watermark.as_ref().is_some_and(|w| pos <= w)
    }

    /// Move the watermark forward. Never moves it back.
    pub fn advance_watermark(&mut self, pos: EventPosition) {
        if self.watermark.as_ref().is_none_or(|w| &pos > w) {
            self.watermark = Some(pos);
        }
    }
}

/// One row of the transition audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ── Connection-level primitives ──────────────────────────────────────

const TASK_COLUMNS: &str = "repo, number, title, phase, plan_iterations, review_iterations, \
     dev_iterations, last_event_at, last_event_id, labels, ci_status, pr_number, head_sha, \
     branch, plan, feedback, pending_role, pending_note, superseded, created_at, updated_at";

fn json_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn conversion_err(e: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let phase: String = row.get(3)?;
    let last_at: Option<String> = row.get(7)?;
    let last_id: Option<String> = row.get(8)?;
    let labels: String = row.get(9)?;
    let ci: String = row.get(10)?;
    let feedback: String = row.get(15)?;
    let pending: Option<String> = row.get(16)?;
    let created: String = row.get(19)?;
    let updated: String = row.get(20)?;

    let watermark = match (last_at, last_id) {
        (Some(at), Some(id)) => Some(EventPosition {
            at: decode_ts(&at)?,
            id,
        }),
        _ => None,
    };

    Ok(Task {
        task_ref: TaskRef::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64),
        title: row.get(2)?,
        phase: phase.parse().map_err(conversion_err)?,
        plan_iterations: row.get(4)?,
        review_iterations: row.get(5)?,
        dev_iterations: row.get(6)?,
        watermark,
        labels: serde_json::from_str(&labels).map_err(json_err)?,
        ci_status: CiStatus::parse(&ci),
        pr_number: row.get::<_, Option<i64>>(11)?.map(|n| n as u64),
        head_sha: row.get(12)?,
        branch: row.get(13)?,
        plan: row.get(14)?,
        feedback: serde_json::from_str(&feedback).map_err(json_err)?,
        pending_role: pending
            .map(|r| r.parse())
            .transpose()
            .map_err(conversion_err)?,
        pending_note: row.get(17)?,
        superseded: row.get(18)?,
        created_at: decode_ts(&created)?,
        updated_at: decode_ts(&updated)?,
    })
}

pub fn load_tx(conn: &Connection, task_ref: &TaskRef) -> anyhow::Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE repo = ?1 AND number = ?2"),
            params![task_ref.repo, task_ref.number as i64],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

pub fn save_tx(conn: &Connection, task: &Task) -> anyhow::Result<()> {
    let (last_at, last_id) = match &task.watermark {
        Some(w) => (Some(encode_ts(&w.at)), Some(w.id.clone())),
        None => (None, None),
    };
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            task.task_ref.repo,
            task.task_ref.number as i64,
            task.title,
            task.phase.as_str(),
            task.plan_iterations,
            task.review_iterations,
            task.dev_iterations,
            last_at,
            last_id,
            serde_json::to_string(&task.labels)?,
            task.ci_status.as_str(),
            task.pr_number.map(|n| n as i64),
            task.head_sha,
            task.branch,
            task.plan,
            serde_json::to_string(&task.feedback)?,
            task.pending_role.map(|r| r.as_str()),
            task.pending_note,
            task.superseded,
            encode_ts(&task.created_at),
            encode_ts(&task.updated_at),
        ],
    )?;
    Ok(())
}

pub fn record_transition_tx(
    conn: &Connection,
    task_ref: &TaskRef,
    from: Phase,
    to: Phase,
    reason: &str,
    at: DateTime<Utc>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO transitions (repo, number, from_phase, to_phase, reason, at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            task_ref.repo,
            task_ref.number as i64,
            from.as_str(),
            to.as_str(),
            reason,
            encode_ts(&at)
        ],
    )?;
    Ok(())
}

// ── Async store ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Db>,
}

impl TaskStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub async fn get(&self, task_ref: &TaskRef) -> anyhow::Result<Option<Task>> {
        let conn = self.db.conn().await;
        load_tx(&conn, task_ref)
    }

    pub async fn save(&self, task: &Task) -> anyhow::Result<()> {
        let conn = self.db.conn().await;
        save_tx(&conn, task)
    }

    /// All tasks, optionally filtered by phase, ordered by repo and number.
    pub async fn list(&self, phase: Option<Phase>) -> anyhow::Result<Vec<Task>> {
        let conn = self.db.conn().await;
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
        if phase.is_some() {
            sql.push_str(" WHERE phase = ?1");
        }
        sql.push_str(" ORDER BY repo, number");
        let mut stmt = conn.prepare(&sql)?;
        let rows = match phase {
            Some(p) => stmt.query_map(params![p.as_str()], row_to_task)?,
            None => stmt.query_map([], row_to_task)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Tasks whose last agent run never finished (the process died mid-run).
    pub async fn interrupted(&self) -> anyhow::Result<Vec<Task>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE pending_role IS NOT NULL ORDER BY repo, number"
        ))?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn history(&self, task_ref: &TaskRef) -> anyhow::Result<Vec<Transition>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare(
            "SELECT from_phase, to_phase, reason, at FROM transitions \
             WHERE repo = ?1 AND number = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_ref.repo, task_ref.number as i64], |row| {
            let from: String = row.get(0)?;
            let to: String = row.get(1)?;
            let at: String = row.get(3)?;
            Ok(Transition {
                from: from.parse().map_err(conversion_err)?,
                to: to.parse().map_err(conversion_err)?,
                reason: row.get(2)?,
                at: decode_ts(&at)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
