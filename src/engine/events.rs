//! Event source. Normalises code-host activity into ordered events.
//!
//! `poll(since)` returns a finite, time-ordered batch (ties broken by id).
//! Delivery is at-least-once: polling again from the same cursor yields the
//! same events or a superset. Dedup happens downstream in the ledger.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use super::commands::{parse_command, Command};
use super::tasks::{EventPosition, TaskRef};
use crate::backends::{CodeHost, PullRequest};
use crate::error::OrchError;

/// Authors whose issues, PRs and comments never drive the pipeline.
const BOT_AUTHORS: &[&str] = &["github-actions[bot]", "dependabot[bot]"];

/// Issues carrying this label are never tracked.
pub const OPT_OUT_LABEL: &str = "no-agent";

pub const PLAN_MARKER: &str = "<!-- planner-agent-plan -->";
pub const REVIEW_MARKER: &str = "<!-- reviewer-agent-feedback -->";
pub const CI_FIX_MARKER: &str = "<!-- ci-fixer-agent-report -->";
/// Status notes (failures, forced approval) posted by the orchestrator.
pub const STATUS_MARKER: &str = "<!-- sdlc-orch-status -->";

const MARKERS: &[&str] = &[PLAN_MARKER, REVIEW_MARKER, CI_FIX_MARKER, STATUS_MARKER];

/// PR body patterns linking to an issue, most specific first.
static LINK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:closes|fixes|resolves|addresses|for)\s*#(\d+)",
        r"(?i)\bissue[:\s]*#?(\d+)",
        r"#(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("BUG: link pattern regex is invalid"))
    .collect()
});

pub fn is_bot(author: &str) -> bool {
    BOT_AUTHORS.contains(&author)
}

/// Whether a comment was written by the orchestrator itself.
pub fn is_orchestrator_comment(body: &str) -> bool {
    MARKERS.iter().any(|m| body.contains(m))
}

/// The issue a PR body refers to, if any.
pub fn linked_issue(body: &str) -> Option<u64> {
    LINK_PATTERNS.iter().find_map(|re| {
        re.captures(body)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    IssueCreated {
        title: String,
        labels: BTreeSet<String>,
    },
    Command(Command),
    PrUpdated {
        pr: u64,
        sha: String,
        branch: String,
    },
    CiCompleted {
        pr: u64,
        sha: String,
        success: bool,
        /// Failed checks, one per line. Empty on success.
        summary: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IssueCreated { .. } => "issue_created",
            Self::Command(Command::Plan(_)) => "command_plan",
            Self::Command(Command::Code(_)) => "command_code",
            Self::PrUpdated { .. } => "pr_updated",
            Self::CiCompleted { .. } => "ci_completed",
        }
    }
}

/// A normalised host event. Immutable once observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Host-derived opaque id, stable across polls.
    pub id: String,
    /// Host event time.
    pub at: DateTime<Utc>,
    pub task: TaskRef,
    pub kind: EventKind,
}

impl Event {
    pub fn position(&self) -> EventPosition {
        EventPosition {
            at: self.at,
            id: self.id.clone(),
        }
    }
}

/// Sort a batch into delivery order: host time, then id.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));
}

/// Polls one repository.
pub struct EventSource {
    host: Arc<dyn CodeHost>,
}

impl EventSource {
    pub fn new(host: Arc<dyn CodeHost>) -> Self {
        Self { host }
    }

    pub fn repo(&self) -> &str {
        self.host.repo()
    }

    /// Events at or after `since`, ordered. Host errors surface as
    /// `SourceUnavailable`; the caller must not advance its cursor then.
    pub async fn poll(&self, since: DateTime<Utc>) -> Result<Vec<Event>, OrchError> {
        let unavailable = |e: anyhow::Error| OrchError::SourceUnavailable(format!("{e:#}"));
        let repo = self.repo().to_string();
        let mut events = Vec::new();

        let issues = self.host.list_issues(since).await.map_err(unavailable)?;
        for issue in issues {
            if issue.created_at < since || is_bot(&issue.author) || issue.has_label(OPT_OUT_LABEL) {
                continue;
            }
            events.push(Event {
                id: format!("issue:{}", issue.number),
                at: issue.created_at,
                task: TaskRef::new(&repo, issue.number),
                kind: EventKind::IssueCreated {
                    title: issue.title,
                    labels: issue.labels.into_iter().collect(),
                },
            });
        }

        let pulls = self.host.list_pull_requests().await.map_err(unavailable)?;
        let linked: Vec<(u64, PullRequest)> = pulls
            .into_iter()
            .filter(|pr| !is_bot(&pr.author))
            .filter_map(|pr| linked_issue(&pr.body).map(|issue| (issue, pr)))
            .filter(|(issue, pr)| *issue != pr.number)
            .collect();
        let pr_to_issue: HashMap<u64, u64> =
            linked.iter().map(|(issue, pr)| (pr.number, *issue)).collect();

        let comments = self.host.comments_since(since).await.map_err(unavailable)?;
        for comment in comments {
            if comment.created_at < since
                || is_bot(&comment.author)
                || is_orchestrator_comment(&comment.body)
            {
                continue;
            }
            let Some(command) = parse_command(&comment.body) else {
                continue;
            };
            let number = pr_to_issue.get(&comment.number).copied().unwrap_or(comment.number);
            events.push(Event {
                id: format!("comment:{}", comment.id),
                at: comment.created_at,
                task: TaskRef::new(&repo, number),
                kind: EventKind::Command(command),
            });
        }

        for (issue, pr) in linked {
            let task = TaskRef::new(&repo, issue);
            if pr.updated_at >= since {
                events.push(Event {
                    id: format!("pr:{}:{}", pr.number, pr.head_sha),
                    at: pr.updated_at,
                    task: task.clone(),
                    kind: EventKind::PrUpdated {
                        pr: pr.number,
                        sha: pr.head_sha.clone(),
                        branch: pr.branch.clone(),
                    },
                });
            }
            if let Some(ci) = self.ci_event(task, &pr, since).await? {
                events.push(ci);
            }
        }

        sort_events(&mut events);
        Ok(events)
    }

    /// One `CiCompleted` per head sha, once every check run has completed.
    async fn ci_event(
        &self,
        task: TaskRef,
        pr: &PullRequest,
        since: DateTime<Utc>,
    ) -> Result<Option<Event>, OrchError> {
        let runs = self
            .host
            .get_check_runs(&pr.head_sha)
            .await
            .map_err(|e| OrchError::SourceUnavailable(format!("{e:#}")))?;
        if runs.is_empty() || !runs.iter().all(|r| r.is_completed()) {
            return Ok(None);
        }
        let Some(completed) = runs.iter().filter_map(|r| r.completed_at).max() else {
            return Ok(None);
        };
        // Always after the PrUpdated for the same head, so the sha is known
        // by the time the result is applied.
        let at = completed.max(pr.updated_at + chrono::Duration::milliseconds(1));
        if at < since {
            return Ok(None);
        }
        let failed: Vec<String> = runs
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| {
                let conclusion = r.conclusion.as_deref().unwrap_or("unknown");
                match &r.summary {
                    Some(s) => format!("- {} ({conclusion}): {s}", r.name),
                    None => format!("- {} ({conclusion})", r.name),
                }
            })
            .collect();
        Ok(Some(Event {
            id: format!("ci:{}", pr.head_sha),
            at,
            task,
            kind: EventKind::CiCompleted {
                pr: pr.number,
                sha: pr.head_sha.clone(),
                success: failed.is_empty(),
                summary: failed.join("\n"),
            },
        }))
    }
}
