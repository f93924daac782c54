//! Code-host abstraction, the capability set the engine consumes.
//!
//! GitHub is the only implementation. Every handle is bound to a single
//! repository; the engine holds one per tracked repository. Transient
//! failures are retried inside the implementation, never by the engine.

pub mod github;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An issue as seen on the host (pull requests excluded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub open: bool,
    pub labels: Vec<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub open: bool,
    pub branch: String,
    pub head_sha: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A comment on an issue or pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    /// Issue or PR number the comment belongs to.
    pub number: u64,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
    /// `queued`, `in_progress` or `completed`.
    pub status: String,
    pub conclusion: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

impl CheckRun {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    /// Neutral and skipped runs do not fail a build.
    pub fn is_success(&self) -> bool {
        matches!(
            self.conclusion.as_deref(),
            Some("success") | Some("neutral") | Some("skipped")
        )
    }
}

/// Pull-request review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Approve,
    RequestChanges,
}

impl Verdict {
    /// The review event name the host expects.
    pub fn as_event(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::RequestChanges => "REQUEST_CHANGES",
        }
    }
}

/// What to open (or update) as a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrDraft {
    pub branch: String,
    pub title: String,
    pub body: String,
}

/// The code-host capability set.
///
/// The engine calls these methods without knowing which host is active.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Human-readable name (e.g. "github")
    fn name(&self) -> &str;

    /// `owner/name` of the bound repository.
    fn repo(&self) -> &str;

    /// Check if connected and authenticated.
    async fn health_check(&self) -> anyhow::Result<()>;

    /// Open issues updated at or after `since`.
    async fn list_issues(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Issue>>;

    /// All open pull requests.
    async fn list_pull_requests(&self) -> anyhow::Result<Vec<PullRequest>>;

    async fn get_issue(&self, number: u64) -> anyhow::Result<Issue>;

    /// Comments across the repository created at or after `since`, oldest first.
    async fn comments_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Comment>>;

    /// All comments of one issue or PR.
    async fn get_comments(&self, number: u64) -> anyhow::Result<Vec<Comment>>;

    async fn get_labels(&self, number: u64) -> anyhow::Result<Vec<String>>;

    async fn add_label(&self, number: u64, label: &str) -> anyhow::Result<()>;

    /// Remove a label; a label that is already gone is not an error.
    async fn remove_label(&self, number: u64, label: &str) -> anyhow::Result<()>;

    async fn post_comment(&self, number: u64, body: &str) -> anyhow::Result<()>;

    async fn post_review(&self, pr: u64, verdict: Verdict, body: &str) -> anyhow::Result<()>;

    /// Check runs for a commit.
    async fn get_check_runs(&self, sha: &str) -> anyhow::Result<Vec<CheckRun>>;

    /// Open a PR for `draft.branch`, or update the open one for that branch.
    async fn open_or_update_pr(&self, draft: &PrDraft) -> anyhow::Result<PullRequest>;

    /// Unified diff of a pull request.
    async fn pull_request_diff(&self, pr: u64) -> anyhow::Result<String>;

    /// Whether an issue or PR is still open.
    async fn is_open(&self, number: u64) -> anyhow::Result<bool> {
        Ok(self.get_issue(number).await?.open)
    }
}
