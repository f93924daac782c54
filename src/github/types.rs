//! GitHub REST response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::{CheckRun, Comment, Issue, PullRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubIssue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<GitHubLabel>,
    pub user: GitHubUser,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present when the issue is actually a pull request.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubLabel {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubUser {
    pub login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    pub user: GitHubUser,
    pub created_at: DateTime<Utc>,
    /// Format: https://api.github.com/repos/owner/repo/issues/123
    pub issue_url: String,
}

impl GitHubComment {
    /// Issue (or PR) number parsed from `issue_url`.
    pub fn issue_number(&self) -> Option<u64> {
        self.issue_url.rsplit('/').next()?.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubRef {
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubPullRequest {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub user: GitHubUser,
    pub head: GitHubRef,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubCheckRuns {
    pub total_count: u64,
    pub check_runs: Vec<GitHubCheckRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubCheckRun {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<GitHubCheckOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubCheckOutput {
    pub title: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubRepo {
    pub default_branch: String,
}

impl From<GitHubIssue> for Issue {
    fn from(i: GitHubIssue) -> Self {
        Issue {
            number: i.number,
            title: i.title,
            body: i.body.unwrap_or_default(),
            open: i.state == "open",
            labels: i.labels.into_iter().map(|l| l.name).collect(),
            author: i.user.login,
            created_at: i.created_at,
            updated_at: i.updated_at,
        }
    }
}

impl From<GitHubPullRequest> for PullRequest {
    fn from(p: GitHubPullRequest) -> Self {
        PullRequest {
            number: p.number,
            title: p.title,
            body: p.body.unwrap_or_default(),
            open: p.state == "open",
            branch: p.head.branch,
            head_sha: p.head.sha,
            author: p.user.login,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

impl From<GitHubCheckRun> for CheckRun {
    fn from(r: GitHubCheckRun) -> Self {
        let summary = r.output.and_then(|o| match (o.title, o.summary) {
            (Some(t), Some(s)) => Some(format!("{t}: {s}")),
            (t, s) => t.or(s),
        });
        CheckRun {
            id: r.id,
            name: r.name,
            status: r.status,
            conclusion: r.conclusion,
            completed_at: r.completed_at,
            summary,
        }
    }
}

impl GitHubComment {
    pub fn into_comment(self) -> Option<Comment> {
        let number = self.issue_number()?;
        Some(Comment {
            id: self.id,
            number,
            body: self.body,
            author: self.user.login,
            created_at: self.created_at,
        })
    }
}
