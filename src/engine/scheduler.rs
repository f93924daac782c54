//! Polling scheduler.
//!
//! One cycle polls every tracked repository, groups the batch by task and
//! hands each group to a job. Jobs for different tasks run in parallel,
//! bounded by a semaphore; a per-task lock keeps two jobs off the same task.
//! A group whose task is busy, or that finds no free slot, is deferred to
//! the next cycle: the repository cursor is held at its earliest event so
//! the next poll delivers it again.
//!
//! Inside a job, each event is applied in one SQLite transaction: ledger
//! mark, resolver decision, counter consumption, watermark, task row and
//! audit rows commit together. Host effects and agent runs follow the
//! commit. A failing job only affects its own task.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use super::events::{is_bot, sort_events, Event, EventKind, EventSource, OPT_OUT_LABEL};
use super::ledger::{mark_processed_tx, Ledger};
use super::resolver::{Disposition, Effect, Resolution, Resolver, Target};
use super::runner::{AgentContext, Dispatcher};
use super::tasks::{record_transition_tx, save_tx, Task, TaskRef, TaskStore, PHASE_LABEL_PREFIX};
use crate::backends::CodeHost;
use crate::db::Db;
use crate::error::OrchError;

/// Re-poll window behind the stored cursor, absorbing host clock skew and
/// late-indexed items. Re-delivered events are dropped by the ledger.
const CURSOR_OVERLAP_SECS: i64 = 120;

/// Failed jobs a group may have before its cursor hold is dropped.
const MAX_JOB_ATTEMPTS: u32 = 3;

/// Everything the scheduler needs for one repository.
pub struct Pipeline {
    source: EventSource,
    host: Arc<dyn CodeHost>,
    dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(host: Arc<dyn CodeHost>, dispatcher: Dispatcher) -> Self {
        Self {
            source: EventSource::new(host.clone()),
            host,
            dispatcher,
        }
    }
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub events: usize,
    pub spawned: usize,
    pub deferred: usize,
    pub failed_repos: usize,
}

/// A group handed to a job that has not finished cleanly.
#[derive(Debug, Clone, Copy)]
struct Unsettled {
    since: DateTime<Utc>,
    failures: u32,
}

pub struct Scheduler {
    db: Arc<Db>,
    ledger: Ledger,
    store: TaskStore,
    resolver: Resolver,
    pipelines: BTreeMap<String, Arc<Pipeline>>,
    locks: Mutex<HashMap<TaskRef, Arc<tokio::sync::Mutex<()>>>>,
    permits: Arc<Semaphore>,
    /// Groups handed to a job that has not finished cleanly. Each holds the
    /// repository cursor at its earliest event.
    unsettled: Mutex<HashMap<TaskRef, Unsettled>>,
    jobs: tokio::sync::Mutex<JoinSet<()>>,
    initial_lookback: chrono::Duration,
}

/// Split a batch into per-task groups, each in delivery order.
pub fn group_by_task(mut events: Vec<Event>) -> BTreeMap<TaskRef, Vec<Event>> {
    sort_events(&mut events);
    let mut groups: BTreeMap<TaskRef, Vec<Event>> = BTreeMap::new();
    for event in events {
        groups.entry(event.task.clone()).or_default().push(event);
    }
    groups
}

/// Next cursor: the newest event seen, held back to anything not yet
/// settled. Never moves backwards.
fn next_cursor(
    stored: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    held: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let candidate = match (newest, held) {
        (Some(n), Some(h)) => Some(n.min(h)),
        (n, h) => n.or(h),
    }?;
    match stored {
        Some(s) if candidate <= s => None,
        _ => Some(candidate),
    }
}

fn min_opt(a: Option<DateTime<Utc>>, b: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(a.map_or(b, |a| a.min(b)))
}

impl Scheduler {
    pub fn new(
        db: Arc<Db>,
        pipelines: Vec<Pipeline>,
        resolver: Resolver,
        max_parallel: usize,
        initial_lookback: chrono::Duration,
    ) -> Self {
        Self {
            ledger: Ledger::new(db.clone()),
            store: TaskStore::new(db.clone()),
            db,
            resolver,
            pipelines: pipelines
                .into_iter()
                .map(|p| (p.host.repo().to_string(), Arc::new(p)))
                .collect(),
            locks: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            unsettled: Mutex::new(HashMap::new()),
            jobs: tokio::sync::Mutex::new(JoinSet::new()),
            initial_lookback,
        }
    }

    pub fn repos(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Arc<dyn CodeHost>> {
        self.pipelines.values().map(|p| &p.host)
    }

    fn lock_for(&self, task: &TaskRef) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(task.clone()).or_default().clone()
    }

    fn held_since(&self, repo: &str) -> Option<DateTime<Utc>> {
        let unsettled = self.unsettled.lock().unwrap_or_else(|e| e.into_inner());
        unsettled
            .iter()
            .filter(|(task, _)| task.repo == repo)
            .map(|(_, u)| u.since)
            .min()
    }

    /// Poll every repository once and start jobs for the ready tasks.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let mut report = CycleReport::default();
        self.reap().await;
        for (repo, pipeline) in &self.pipelines {
            if let Err(e) = self.poll_repo(repo, pipeline, &mut report).await {
                report.failed_repos += 1;
                let retryable = e.downcast_ref::<OrchError>().is_some_and(OrchError::is_retryable);
                if retryable {
                    tracing::warn!(repo, err = %format!("{e:#}"), "poll cycle failed, cursor kept");
                } else {
                    tracing::error!(repo, err = %format!("{e:#}"), "poll cycle failed, cursor kept");
                }
            }
        }
        if report.events > 0 {
            tracing::info!(
                events = report.events,
                spawned = report.spawned,
                deferred = report.deferred,
                "poll cycle done"
            );
        }
        report
    }

    async fn poll_repo(
        self: &Arc<Self>,
        repo: &str,
        pipeline: &Arc<Pipeline>,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        let stored = self.ledger.cursor(repo).await?;
        let since = match stored {
            Some(cursor) => cursor - chrono::Duration::seconds(CURSOR_OVERLAP_SECS),
            None => Utc::now() - self.initial_lookback,
        };

        let events = pipeline.source.poll(since).await?;
        report.events += events.len();
        let newest = events.iter().map(|e| e.at).max();
        let mut held: Option<DateTime<Utc>> = None;

        for (task_ref, group) in group_by_task(events) {
            let first_at = group[0].at;
            let Ok(guard) = self.lock_for(&task_ref).try_lock_owned() else {
                tracing::debug!(task = %task_ref, "task busy, deferring events");
                held = min_opt(held, first_at);
                report.deferred += 1;
                continue;
            };
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::debug!(task = %task_ref, "all parallel slots busy, deferring events");
                held = min_opt(held, first_at);
                report.deferred += 1;
                continue;
            };
            {
                let mut unsettled = self.unsettled.lock().unwrap_or_else(|e| e.into_inner());
                unsettled
                    .entry(task_ref.clone())
                    .and_modify(|u| u.since = first_at)
                    .or_insert(Unsettled {
                        since: first_at,
                        failures: 0,
                    });
            }
            self.spawn_job(pipeline.clone(), task_ref, group, guard, permit).await;
            report.spawned += 1;
        }

        if let Some(h) = self.held_since(repo) {
            held = min_opt(held, h);
        }
        if let Some(cursor) = next_cursor(stored, newest, held) {
            self.ledger.store_cursor(repo, cursor).await?;
            tracing::debug!(repo, %cursor, "cursor advanced");
        }
        Ok(())
    }

    async fn spawn_job(
        self: &Arc<Self>,
        pipeline: Arc<Pipeline>,
        task_ref: TaskRef,
        events: Vec<Event>,
        guard: OwnedMutexGuard<()>,
        permit: OwnedSemaphorePermit,
    ) {
        let this = self.clone();
        let mut jobs = self.jobs.lock().await;
        jobs.spawn(async move {
            let result = this.process_task(&pipeline, &task_ref, events).await;
            this.settle(&task_ref, result);
            drop(guard);
            drop(permit);
        });
    }

    /// Release the cursor hold of a finished job. A failed group keeps its
    /// hold, so it is polled again, until it has failed `MAX_JOB_ATTEMPTS` times.
    fn settle(&self, task_ref: &TaskRef, result: anyhow::Result<()>) {
        let mut unsettled = self.unsettled.lock().unwrap_or_else(|e| e.into_inner());
        let Err(e) = result else {
            unsettled.remove(task_ref);
            return;
        };
        let Some(entry) = unsettled.get_mut(task_ref) else {
            tracing::error!(task = %task_ref, err = %format!("{e:#}"), "task job failed");
            return;
        };
        entry.failures += 1;
        if entry.failures >= MAX_JOB_ATTEMPTS {
            unsettled.remove(task_ref);
            tracing::error!(
                task = %task_ref,
                attempts = MAX_JOB_ATTEMPTS,
                err = %format!("{e:#}"),
                "task job keeps failing, giving up on its events"
            );
        } else {
            tracing::warn!(
                task = %task_ref,
                attempt = entry.failures,
                err = %format!("{e:#}"),
                "task job failed, events will be retried"
            );
        }
    }

    /// Collect finished jobs.
    async fn reap(&self) {
        let mut jobs = self.jobs.lock().await;
        while let Some(result) = jobs.try_join_next() {
            if let Err(e) = result {
                tracing::error!(err = %e, "task job panicked");
            }
        }
    }

    /// Wait for every running job.
    pub async fn drain(&self) {
        let mut jobs = self.jobs.lock().await;
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                tracing::error!(err = %e, "task job panicked");
            }
        }
    }

    /// One cycle, then wait for its jobs.
    pub async fn tick(self: &Arc<Self>) -> CycleReport {
        let report = self.run_cycle().await;
        self.drain().await;
        report
    }

    /// Re-dispatch agent runs the previous process never finished.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<usize> {
        let interrupted = self.store.interrupted().await?;
        let mut resumed = 0;
        for task in interrupted {
            let Some(pipeline) = self.pipelines.get(&task.task_ref.repo).cloned() else {
                continue;
            };
            let role = task.pending_role.map(|r| r.as_str()).unwrap_or_default();
            tracing::info!(task = %task.task_ref, role, "resuming interrupted agent run");
            let guard = self.lock_for(&task.task_ref).lock_owned().await;
            let permit = self.permits.clone().acquire_owned().await?;
            self.spawn_job(pipeline, task.task_ref, Vec::new(), guard, permit).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn process_task(&self, pipeline: &Pipeline, task_ref: &TaskRef, events: Vec<Event>) -> anyhow::Result<()> {
        // Finish an interrupted run before looking at anything newer
        self.dispatch_pending(pipeline, task_ref).await?;
        for event in events {
            self.apply_event(pipeline, task_ref, &event).await?;
            self.dispatch_pending(pipeline, task_ref).await?;
        }
        Ok(())
    }

    /// Load the task, or start tracking it on its first actionable event.
    async fn load_or_track(&self, pipeline: &Pipeline, event: &Event) -> anyhow::Result<Option<Task>> {
        if let Some(task) = self.store.get(&event.task).await? {
            return Ok(Some(task));
        }
        let now = Utc::now();
        match &event.kind {
            EventKind::IssueCreated { title, .. } => Ok(Some(Task::new(event.task.clone(), title.clone(), now))),
            EventKind::Command(_) => {
                let issue = pipeline.host.get_issue(event.task.number).await?;
                if !issue.open || issue.has_label(OPT_OUT_LABEL) || is_bot(&issue.author) {
                    tracing::debug!(task = %event.task, "command on an untracked issue");
                    return Ok(None);
                }
                let mut task = Task::new(event.task.clone(), issue.title, now);
                task.labels = issue.labels.into_iter().collect();
                Ok(Some(task))
            }
            _ => Ok(None),
        }
    }

    async fn apply_event(&self, pipeline: &Pipeline, task_ref: &TaskRef, event: &Event) -> anyhow::Result<()> {
        // Re-delivered events stop here, before any host lookup
        if !self.ledger.should_process(task_ref, &event.id).await? {
            tracing::debug!(task = %task_ref, event = %event.id, "event already processed");
            return Ok(());
        }
        let Some(mut task) = self.load_or_track(pipeline, event).await? else {
            tracing::debug!(task = %task_ref, event = %event.id, "event for untracked task dropped");
            return Ok(());
        };
        let pos = event.position();
        if task.is_stale(&pos) {
            let err = OrchError::StaleEvent(event.id.clone());
            tracing::debug!(task = %task_ref, err = %err, "event at or before the watermark dropped");
            return Ok(());
        }

        let now = Utc::now();
        let res = {
            let mut conn = self.db.conn().await;
            let tx = conn.transaction()?;
            if !mark_processed_tx(&tx, task_ref, &event.id, now)? {
                tracing::debug!(task = %task_ref, event = %event.id, "event already processed");
                return Ok(());
            }
            let res = self.resolver.on_event(&mut task, event, now);
            task.advance_watermark(pos);
            commit_tx(&tx, &mut task, &res, now)?;
            tx.commit()?;
            res
        };

        match res.disposition {
            Disposition::Applied => tracing::info!(
                task = %task_ref,
                event = %event.id,
                kind = event.kind.name(),
                phase = %task.phase,
                reason = %res.reason,
                "event applied"
            ),
            Disposition::Ignored => tracing::debug!(task = %task_ref, event = %event.id, reason = %res.reason, "event ignored"),
            Disposition::Stale => tracing::debug!(task = %task_ref, event = %event.id, reason = %res.reason, "stale event discarded"),
        }

        self.apply_effects(pipeline, &mut task, &res).await?;
        Ok(())
    }

    /// Run the pending agent, resolve its outcome, repeat until nothing is pending.
    async fn dispatch_pending(&self, pipeline: &Pipeline, task_ref: &TaskRef) -> anyhow::Result<()> {
        loop {
            let Some(task) = self.store.get(task_ref).await? else {
                return Ok(());
            };
            let Some(role) = task.pending_role else {
                return Ok(());
            };
            let ctx = AgentContext {
                note: task.pending_note.clone(),
                task,
            };
            let run = pipeline.dispatcher.run(role, &ctx).await;

            let mut task = ctx.task;
            let now = Utc::now();
            let res = self.resolver.on_outcome(&mut task, &run, now);
            {
                let mut conn = self.db.conn().await;
                let tx = conn.transaction()?;
                commit_tx(&tx, &mut task, &res, now)?;
                tx.commit()?;
            }
            tracing::info!(
                task = %task_ref,
                role = %role,
                outcome = run.outcome.label(),
                calls = run.model_call_count,
                started = %run.started_at,
                phase = %task.phase,
                reason = %res.reason,
                "agent outcome applied"
            );
            self.apply_effects(pipeline, &mut task, &res).await?;
        }
    }

    /// Push the committed decision to the host. Failures are logged; the
    /// decision itself is already durable.
    async fn apply_effects(&self, pipeline: &Pipeline, task: &mut Task, res: &Resolution) -> anyhow::Result<()> {
        let host = pipeline.host.as_ref();
        let number = task.task_ref.number;
        let mut pr_changed = false;

        for effect in &res.effects {
            let result = match effect {
                Effect::Comment { target, body } => {
                    let on = match target {
                        Target::Issue => number,
                        Target::PullRequest => task.pr_number.unwrap_or(number),
                    };
                    host.post_comment(on, body).await
                }
                Effect::Review { verdict, body } => match task.pr_number {
                    Some(pr) => host.post_review(pr, *verdict, body).await,
                    None => host.post_comment(number, body).await,
                },
                Effect::OpenOrUpdatePr(draft) => match host.open_or_update_pr(draft).await {
                    Ok(pr) => {
                        if task.pr_number != Some(pr.number) {
                            tracing::info!(task = %task.task_ref, pr = pr.number, "pull request opened");
                            task.pr_number = Some(pr.number);
                            pr_changed = true;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = result {
                tracing::warn!(task = %task.task_ref, err = %format!("{e:#}"), "host update failed");
            }
        }

        if pr_changed {
            self.store.save(task).await?;
        }
        if !res.transitions.is_empty() {
            if let Err(e) = sync_phase_label(host, task).await {
                tracing::warn!(task = %task.task_ref, err = %format!("{e:#}"), "phase label sync failed");
            }
        }
        Ok(())
    }
}

/// Persist a decision: task row plus one audit row per phase change.
fn commit_tx(conn: &rusqlite::Connection, task: &mut Task, res: &Resolution, now: DateTime<Utc>) -> anyhow::Result<()> {
    if !res.transitions.is_empty() {
        task.labels.retain(|l| !l.starts_with(PHASE_LABEL_PREFIX));
        task.labels.insert(task.phase.label());
    }
    save_tx(conn, task)?;
    for (from, to, reason) in &res.transitions {
        record_transition_tx(conn, &task.task_ref, *from, *to, reason, now)?;
    }
    Ok(())
}

/// Make the issue carry exactly the label of the current phase.
async fn sync_phase_label(host: &dyn CodeHost, task: &Task) -> anyhow::Result<()> {
    let number = task.task_ref.number;
    let want = task.phase.label();
    let current = host.get_labels(number).await?;
    for label in current.iter().filter(|l| l.starts_with(PHASE_LABEL_PREFIX) && **l != want) {
        host.remove_label(number, label).await?;
    }
    if !current.contains(&want) {
        host.add_label(number, &want).await?;
    }
    Ok(())
}
