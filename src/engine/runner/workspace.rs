//! Repository checkouts the coding agents work in.
//!
//! Each task gets its own clone at
//! `<workspace.root>/<owner>__<name>/issue-<n>/` on branch `sdlc/issue-<n>`.
//! File access is confined to the checkout.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;

use crate::engine::tasks::Task;

/// Branch the agents push to for an issue.
pub fn branch_name(number: u64) -> String {
    format!("sdlc/issue-{number}")
}

/// The tool surface a coding agent works through.
#[async_trait]
pub trait Workspace: Send + Sync {
    fn branch(&self) -> &str;

    /// Tracked and untracked (non-ignored) files, optionally under `dir`.
    async fn list_files(&self, dir: Option<&str>) -> anyhow::Result<Vec<String>>;

    async fn read_file(&self, path: &str) -> anyhow::Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;

    /// Commit everything and push. Returns the new head sha, or `None` when
    /// there was nothing to commit.
    async fn commit_and_push(&self, message: &str) -> anyhow::Result<Option<String>>;
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// A clean checkout of the task's branch.
    async fn prepare(&self, task: &Task) -> anyhow::Result<Box<dyn Workspace>>;
}

/// Reject absolute paths and anything escaping the checkout or touching `.git`.
pub fn confine(root: &Path, rel: &str) -> anyhow::Result<PathBuf> {
    let rel_path = Path::new(rel.trim());
    if rel.trim().is_empty() {
        anyhow::bail!("empty path");
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(part) if part == ".git" => {
                anyhow::bail!("path {rel} points into .git")
            }
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("path {rel} escapes the workspace"),
        }
    }
    Ok(root.join(rel_path))
}

/// Run git in `dir`, failing with stderr on a non-zero exit.
async fn git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Git-CLI backed checkouts under a root directory.
pub struct GitWorkspaces {
    root: PathBuf,
    token: String,
}

impl GitWorkspaces {
    pub fn new(root: PathBuf, token: String) -> Self {
        Self { root, token }
    }

    fn checkout_dir(&self, task: &Task) -> PathBuf {
        self.root
            .join(task.task_ref.repo.replace('/', "__"))
            .join(format!("issue-{}", task.task_ref.number))
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorkspaces {
    async fn prepare(&self, task: &Task) -> anyhow::Result<Box<dyn Workspace>> {
        let dir = self.checkout_dir(task);
        let repo = &task.task_ref.repo;

        if !dir.join(".git").exists() {
            let parent = dir
                .parent()
                .ok_or_else(|| anyhow::anyhow!("invalid workspace path {}", dir.display()))?;
            tokio::fs::create_dir_all(parent).await?;
            let url = format!("https://x-access-token:{}@github.com/{repo}.git", self.token);
            let target = dir.to_string_lossy().to_string();
            tracing::info!(task = %task.task_ref, dir = %dir.display(), "cloning repository");
            git(parent, &["clone", "--quiet", &url, &target]).await?;
        }

        git(&dir, &["fetch", "--quiet", "--prune", "origin"]).await?;

        let branch = task
            .branch
            .clone()
            .unwrap_or_else(|| branch_name(task.task_ref.number));
        let remote = format!("origin/{branch}");
        let start = if git(&dir, &["rev-parse", "--verify", "--quiet", &remote])
            .await
            .is_ok()
        {
            remote
        } else {
            "origin/HEAD".to_string()
        };
        git(&dir, &["checkout", "--quiet", "-B", &branch, &start]).await?;
        git(&dir, &["reset", "--quiet", "--hard", &start]).await?;
        git(&dir, &["clean", "-fdq"]).await?;

        tracing::debug!(task = %task.task_ref, branch, "workspace ready");
        Ok(Box::new(GitWorkspace { dir, branch }))
    }
}

pub struct GitWorkspace {
    dir: PathBuf,
    branch: String,
}

#[async_trait]
impl Workspace for GitWorkspace {
    fn branch(&self) -> &str {
        &self.branch
    }

    async fn list_files(&self, dir: Option<&str>) -> anyhow::Result<Vec<String>> {
        let out = git(
            &self.dir,
            &["ls-files", "--cached", "--others", "--exclude-standard"],
        )
        .await?;
        let prefix = dir
            .map(|d| d.trim().trim_matches('/'))
            .filter(|d| !d.is_empty() && *d != ".");
        Ok(out
            .lines()
            .filter(|f| prefix.is_none_or(|p| f.starts_with(&format!("{p}/"))))
            .map(String::from)
            .collect())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        let full = confine(&self.dir, path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let full = confine(&self.dir, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| anyhow::anyhow!("cannot write {path}: {e}"))
    }

    async fn commit_and_push(&self, message: &str) -> anyhow::Result<Option<String>> {
        let status = git(&self.dir, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(None);
        }
        git(&self.dir, &["add", "-A"]).await?;
        git(
            &self.dir,
            &[
                "-c",
                "user.name=sdlc-orch",
                "-c",
                "user.email=sdlc-orch@users.noreply.github.com",
                "commit",
                "--quiet",
                "-m",
                message,
            ],
        )
        .await?;
        git(&self.dir, &["push", "--quiet", "-u", "origin", &self.branch]).await?;
        let sha = git(&self.dir, &["rev-parse", "HEAD"]).await?;
        tracing::info!(branch = %self.branch, sha, "pushed branch");
        Ok(Some(sha))
    }
}
