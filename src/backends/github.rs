//! GitHub backend: `CodeHost` over the native REST client.
//!
//! Retries, rate-limit tracking and pagination live in `GhHttp`; this layer
//! maps GitHub's shapes onto the host-neutral types.

use super::{CheckRun, CodeHost, Comment, Issue, PrDraft, PullRequest, Verdict};
use crate::backoff::RetryPolicy;
use crate::github::http::GhHttp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

pub struct GitHubBackend {
    repo: String,
    gh: GhHttp,
    default_branch: OnceCell<String>,
}

impl GitHubBackend {
    pub fn new(repo: String, token: String, retry: RetryPolicy) -> anyhow::Result<Self> {
        Ok(Self {
            repo,
            gh: GhHttp::new(token, retry)?,
            default_branch: OnceCell::new(),
        })
    }

    async fn base_branch(&self) -> anyhow::Result<&str> {
        let branch = self
            .default_branch
            .get_or_try_init(|| async {
                self.gh.get_repo(&self.repo).await.map(|r| r.default_branch)
            })
            .await?;
        Ok(branch.as_str())
    }
}

#[async_trait]
impl CodeHost for GitHubBackend {
    fn name(&self) -> &str {
        "github"
    }

    fn repo(&self) -> &str {
        &self.repo
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        self.gh.auth_status().await
    }

    async fn list_issues(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Issue>> {
        let issues = self.gh.list_open_issues(&self.repo, since).await?;
        Ok(issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(Issue::from)
            .collect())
    }

    async fn list_pull_requests(&self) -> anyhow::Result<Vec<PullRequest>> {
        let pulls = self.gh.list_open_pulls(&self.repo).await?;
        Ok(pulls.into_iter().map(PullRequest::from).collect())
    }

    async fn get_issue(&self, number: u64) -> anyhow::Result<Issue> {
        Ok(self.gh.get_issue(&self.repo, number).await?.into())
    }

    async fn comments_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Comment>> {
        let comments = self.gh.list_comments_since(&self.repo, since).await?;
        Ok(comments
            .into_iter()
            .filter_map(|c| c.into_comment())
            // `since` filters on update time; keep only comments created in the window
            .filter(|c| c.created_at >= since)
            .collect())
    }

    async fn get_comments(&self, number: u64) -> anyhow::Result<Vec<Comment>> {
        let comments = self.gh.list_comments(&self.repo, number).await?;
        Ok(comments.into_iter().filter_map(|c| c.into_comment()).collect())
    }

    async fn get_labels(&self, number: u64) -> anyhow::Result<Vec<String>> {
        let labels = self.gh.get_labels(&self.repo, number).await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn add_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        self.gh.add_labels(&self.repo, number, &[label]).await
    }

    async fn remove_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        self.gh.remove_label(&self.repo, number, label).await
    }

    async fn post_comment(&self, number: u64, body: &str) -> anyhow::Result<()> {
        self.gh.add_comment(&self.repo, number, body).await
    }

    async fn post_review(&self, pr: u64, verdict: Verdict, body: &str) -> anyhow::Result<()> {
        match self
            .gh
            .create_review(&self.repo, pr, verdict.as_event(), body)
            .await
        {
            Ok(()) => Ok(()),
            // GitHub refuses reviews on your own PR; keep the verdict visible as a comment
            Err(e) if e.to_string().contains("(422") => {
                tracing::warn!(repo = %self.repo, pr, err = %e, "review rejected, posting as comment");
                self.gh.add_comment(&self.repo, pr, body).await
            }
            Err(e) => Err(e),
        }
    }

    async fn get_check_runs(&self, sha: &str) -> anyhow::Result<Vec<CheckRun>> {
        let runs = self.gh.get_check_runs(&self.repo, sha).await?;
        Ok(runs.check_runs.into_iter().map(CheckRun::from).collect())
    }

    async fn open_or_update_pr(&self, draft: &PrDraft) -> anyhow::Result<PullRequest> {
        let existing = self
            .gh
            .find_open_pulls_for_branch(&self.repo, &draft.branch)
            .await?;
        let pr = match existing.into_iter().next() {
            Some(pr) => {
                self.gh
                    .update_pull(&self.repo, pr.number, &draft.title, &draft.body)
                    .await?
            }
            None => {
                let base = self.base_branch().await?;
                self.gh
                    .create_pull(&self.repo, &draft.branch, base, &draft.title, &draft.body)
                    .await?
            }
        };
        Ok(pr.into())
    }

    async fn pull_request_diff(&self, pr: u64) -> anyhow::Result<String> {
        self.gh.get_pull_diff(&self.repo, pr).await
    }
}
