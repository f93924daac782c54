//! In-memory doubles for the host, the model and the workspace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backends::{CheckRun, CodeHost, Comment, Issue, PrDraft, PullRequest, Verdict};
use crate::engine::runner::workspace::{branch_name, confine, Workspace, WorkspaceProvider};
use crate::engine::runner::AgentRole;
use crate::engine::tasks::Task;
use crate::error::OrchError;
use crate::llm::{LanguageModel, Message, Reply, Role, ToolCall, ToolSpec};

/// Author of everything the orchestrator posts through the fake.
const SELF_AUTHOR: &str = "sdlc-orch";

#[derive(Default)]
struct HostState {
    clock: Option<DateTime<Utc>>,
    issues: BTreeMap<u64, Issue>,
    pulls: BTreeMap<u64, PullRequest>,
    comments: Vec<Comment>,
    checks: HashMap<String, Vec<CheckRun>>,
    branches: HashMap<String, String>,
    reviews: Vec<(u64, Verdict, String)>,
    fail_reads: bool,
}

impl HostState {
    /// Advance the logical clock by one second.
    fn tick(&mut self) -> DateTime<Utc> {
        let next = self.clock.unwrap_or_else(Utc::now) + chrono::Duration::seconds(1);
        self.clock = Some(next);
        next
    }

    fn next_number(&self) -> u64 {
        let issues = self.issues.keys().max().copied().unwrap_or(0);
        let pulls = self.pulls.keys().max().copied().unwrap_or(0);
        issues.max(pulls) + 1
    }

    fn reads(&self) -> anyhow::Result<()> {
        if self.fail_reads {
            anyhow::bail!("GitHub API GET failed (503): service unavailable");
        }
        Ok(())
    }
}

/// A single repository held in memory. Every mutation advances a logical
/// clock by one second, starting ten minutes in the past.
pub struct FakeHost {
    repo: String,
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new(repo: &str) -> Self {
        let state = HostState {
            clock: Some(Utc::now() - chrono::Duration::minutes(10)),
            ..HostState::default()
        };
        Self {
            repo: repo.to_string(),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn repo_name(&self) -> String {
        self.repo.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state().clock.unwrap()
    }

    pub fn open_issue(&self, number: u64, title: &str, labels: &[&str]) {
        let mut s = self.state();
        let at = s.tick();
        s.issues.insert(
            number,
            Issue {
                number,
                title: title.to_string(),
                body: format!("Body of issue {number}"),
                open: true,
                labels: labels.iter().map(|l| l.to_string()).collect(),
                author: "octocat".into(),
                created_at: at,
                updated_at: at,
            },
        );
    }

    pub fn close_issue(&self, number: u64) {
        let mut s = self.state();
        let at = s.tick();
        if let Some(issue) = s.issues.get_mut(&number) {
            issue.open = false;
            issue.updated_at = at;
        }
    }

    pub fn comment(&self, number: u64, author: &str, body: &str) -> u64 {
        let mut s = self.state();
        let at = s.tick();
        let id = s.comments.len() as u64 + 1000;
        s.comments.push(Comment {
            id,
            number,
            body: body.to_string(),
            author: author.to_string(),
            created_at: at,
        });
        if let Some(issue) = s.issues.get_mut(&number) {
            issue.updated_at = at;
        }
        id
    }

    /// Open a PR from a human on `branch`, already pushed at `sha`.
    pub fn open_pr(&self, branch: &str, sha: &str, body: &str) -> u64 {
        let mut s = self.state();
        let at = s.tick();
        let number = s.next_number();
        s.branches.insert(branch.to_string(), sha.to_string());
        s.pulls.insert(
            number,
            PullRequest {
                number,
                title: format!("PR {number}"),
                body: body.to_string(),
                open: true,
                branch: branch.to_string(),
                head_sha: sha.to_string(),
                author: "octocat".into(),
                created_at: at,
                updated_at: at,
            },
        );
        number
    }

    /// Move a branch; open PRs on it follow.
    pub fn push_branch(&self, branch: &str, sha: &str) {
        let mut s = self.state();
        let at = s.tick();
        s.branches.insert(branch.to_string(), sha.to_string());
        for pr in s.pulls.values_mut().filter(|p| p.open && p.branch == branch) {
            pr.head_sha = sha.to_string();
            pr.updated_at = at;
        }
    }

    /// Edit a PR without touching its head.
    pub fn edit_pr_title(&self, pr: u64, title: &str) {
        let mut s = self.state();
        let at = s.tick();
        if let Some(p) = s.pulls.get_mut(&pr) {
            p.title = title.to_string();
            p.updated_at = at;
        }
    }

    pub fn branch_head(&self, branch: &str) -> Option<String> {
        self.state().branches.get(branch).cloned()
    }

    pub fn pr_head(&self, pr: u64) -> Option<String> {
        self.state().pulls.get(&pr).map(|p| p.head_sha.clone())
    }

    pub fn pr_body(&self, pr: u64) -> Option<String> {
        self.state().pulls.get(&pr).map(|p| p.body.clone())
    }

    pub fn complete_checks(&self, sha: &str, runs: &[(&str, &str)]) {
        let mut s = self.state();
        let at = s.tick();
        let runs = runs
            .iter()
            .enumerate()
            .map(|(i, (name, conclusion))| CheckRun {
                id: i as u64 + 1,
                name: name.to_string(),
                status: "completed".into(),
                conclusion: Some(conclusion.to_string()),
                completed_at: Some(at),
                summary: None,
            })
            .collect();
        s.checks.insert(sha.to_string(), runs);
    }

    pub fn start_checks(&self, sha: &str, names: &[&str]) {
        let mut s = self.state();
        s.tick();
        let runs = names
            .iter()
            .enumerate()
            .map(|(i, name)| CheckRun {
                id: i as u64 + 1,
                name: name.to_string(),
                status: "in_progress".into(),
                conclusion: None,
                completed_at: None,
                summary: None,
            })
            .collect();
        s.checks.insert(sha.to_string(), runs);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    /// Bodies of every comment on an issue or PR, oldest first.
    pub fn comments_on(&self, number: u64) -> Vec<String> {
        self.state()
            .comments
            .iter()
            .filter(|c| c.number == number)
            .map(|c| c.body.clone())
            .collect()
    }

    pub fn labels(&self, number: u64) -> Vec<String> {
        self.state()
            .issues
            .get(&number)
            .map(|i| i.labels.clone())
            .unwrap_or_default()
    }

    pub fn reviews(&self, pr: u64) -> Vec<Verdict> {
        self.state()
            .reviews
            .iter()
            .filter(|(n, _, _)| *n == pr)
            .map(|(_, v, _)| *v)
            .collect()
    }
}

#[async_trait]
impl CodeHost for FakeHost {
    fn name(&self) -> &str {
        "fake"
    }

    fn repo(&self) -> &str {
        &self.repo
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_issues(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Issue>> {
        let s = self.state();
        s.reads()?;
        Ok(s.issues
            .values()
            .filter(|i| i.open && i.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn list_pull_requests(&self) -> anyhow::Result<Vec<PullRequest>> {
        let s = self.state();
        s.reads()?;
        Ok(s.pulls.values().filter(|p| p.open).cloned().collect())
    }

    async fn get_issue(&self, number: u64) -> anyhow::Result<Issue> {
        let s = self.state();
        if let Some(issue) = s.issues.get(&number) {
            return Ok(issue.clone());
        }
        match s.pulls.get(&number) {
            Some(pr) => Ok(Issue {
                number,
                title: pr.title.clone(),
                body: pr.body.clone(),
                open: pr.open,
                labels: Vec::new(),
                author: pr.author.clone(),
                created_at: pr.created_at,
                updated_at: pr.updated_at,
            }),
            None => anyhow::bail!("GitHub API GET failed (404): issue {number} not found"),
        }
    }

    async fn comments_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Comment>> {
        let s = self.state();
        s.reads()?;
        Ok(s.comments.iter().filter(|c| c.created_at >= since).cloned().collect())
    }

    async fn get_comments(&self, number: u64) -> anyhow::Result<Vec<Comment>> {
        let s = self.state();
        Ok(s.comments.iter().filter(|c| c.number == number).cloned().collect())
    }

    async fn get_labels(&self, number: u64) -> anyhow::Result<Vec<String>> {
        Ok(self.labels(number))
    }

    async fn add_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        let mut s = self.state();
        if let Some(issue) = s.issues.get_mut(&number) {
            if !issue.has_label(label) {
                issue.labels.push(label.to_string());
            }
        }
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        let mut s = self.state();
        if let Some(issue) = s.issues.get_mut(&number) {
            issue.labels.retain(|l| l != label);
        }
        Ok(())
    }

    async fn post_comment(&self, number: u64, body: &str) -> anyhow::Result<()> {
        self.comment(number, SELF_AUTHOR, body);
        Ok(())
    }

    async fn post_review(&self, pr: u64, verdict: Verdict, body: &str) -> anyhow::Result<()> {
        let mut s = self.state();
        if !s.pulls.contains_key(&pr) {
            anyhow::bail!("GitHub API POST failed (404): pull request {pr} not found");
        }
        s.tick();
        s.reviews.push((pr, verdict, body.to_string()));
        Ok(())
    }

    async fn get_check_runs(&self, sha: &str) -> anyhow::Result<Vec<CheckRun>> {
        let s = self.state();
        s.reads()?;
        Ok(s.checks.get(sha).cloned().unwrap_or_default())
    }

    async fn open_or_update_pr(&self, draft: &PrDraft) -> anyhow::Result<PullRequest> {
        let mut s = self.state();
        let Some(sha) = s.branches.get(&draft.branch).cloned() else {
            anyhow::bail!("GitHub API POST failed (422): branch {} does not exist", draft.branch);
        };
        let at = s.tick();
        if let Some(pr) = s.pulls.values_mut().find(|p| p.open && p.branch == draft.branch) {
            pr.title = draft.title.clone();
            pr.body = draft.body.clone();
            pr.head_sha = sha;
            pr.updated_at = at;
            return Ok(pr.clone());
        }
        let number = s.next_number();
        let pr = PullRequest {
            number,
            title: draft.title.clone(),
            body: draft.body.clone(),
            open: true,
            branch: draft.branch.clone(),
            head_sha: sha,
            author: SELF_AUTHOR.into(),
            created_at: at,
            updated_at: at,
        };
        s.pulls.insert(number, pr.clone());
        Ok(pr)
    }

    async fn pull_request_diff(&self, pr: u64) -> anyhow::Result<String> {
        let s = self.state();
        match s.pulls.get(&pr) {
            Some(p) => Ok(format!(
                "diff --git a/src/issue.rs b/src/issue.rs\n+// head {}\n",
                p.head_sha
            )),
            None => anyhow::bail!("GitHub API GET failed (404): pull request {pr} not found"),
        }
    }
}

/// A reviewer reply approving or requesting changes.
pub fn verdict_reply(approve: bool) -> Reply {
    if approve {
        Reply::Text(r#"{"verdict": "approve", "summary": "Looks good", "issues": []}"#.into())
    } else {
        Reply::Text(
            r#"{"verdict": "changes_requested", "summary": "Not yet", "issues": ["add a test"]}"#.into(),
        )
    }
}

type CallHook = Arc<dyn Fn(AgentRole, u32) + Send + Sync>;

#[derive(Default)]
struct ModelState {
    scripts: HashMap<AgentRole, VecDeque<Reply>>,
    calls: HashMap<AgentRole, u32>,
    prompts: HashMap<AgentRole, String>,
    fail: bool,
    after_call: Option<CallHook>,
}

/// Replies per agent role, recognised from the system prompt. Roles without
/// a script get a default: planners plan, coders write one file and finish,
/// reviewers approve.
#[derive(Default)]
pub struct ScriptedModel {
    state: Mutex<ModelState>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap()
    }

    pub fn script(&self, role: AgentRole, replies: Vec<Reply>) {
        self.state().scripts.entry(role).or_default().extend(replies);
    }

    pub fn fail(&self, fail: bool) {
        self.state().fail = fail;
    }

    /// Run `hook` with the role and its call number after every reply.
    pub fn after_call(&self, hook: impl Fn(AgentRole, u32) + Send + Sync + 'static) {
        self.state().after_call = Some(Arc::new(hook));
    }

    pub fn calls(&self, role: AgentRole) -> u32 {
        self.state().calls.get(&role).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.state().calls.values().sum()
    }

    /// All message text of the latest call for `role`.
    pub fn last_prompt(&self, role: AgentRole) -> Option<String> {
        self.state().prompts.get(&role).cloned()
    }

    fn role_of(messages: &[Message]) -> Option<AgentRole> {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .and_then(|m| m.content.as_deref())?;
        [AgentRole::Planner, AgentRole::Coder, AgentRole::Reviewer, AgentRole::CiFixer]
            .into_iter()
            .find(|r| system.contains(&format!("the {} agent", r.as_str().replace('_', "-"))))
    }

    fn default_reply(role: AgentRole, messages: &[Message], call: u32) -> Reply {
        match role {
            AgentRole::Planner => Reply::Text("1. Implement the change\n2. Add tests".into()),
            AgentRole::Reviewer => verdict_reply(true),
            AgentRole::Coder | AgentRole::CiFixer => {
                let edited = messages.iter().any(|m| m.role == Role::Tool);
                let tool = if edited {
                    ToolCall {
                        id: format!("call-{call}"),
                        name: "finish".into(),
                        arguments: serde_json::json!({
                            "summary": "Implemented the change",
                            "diagnosis": "The test expected the new behaviour",
                        }),
                    }
                } else {
                    ToolCall {
                        id: format!("call-{call}"),
                        name: "write_file".into(),
                        arguments: serde_json::json!({
                            "path": "src/issue.rs",
                            "content": format!("// revision {call}\n"),
                        }),
                    }
                };
                Reply::ToolCalls(vec![tool])
            }
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, messages: &[Message], _tools: &[ToolSpec]) -> Result<Reply, OrchError> {
        let role = Self::role_of(messages)
            .ok_or_else(|| OrchError::ModelUnavailable("no agent role in system prompt".into()))?;
        let mut s = self.state();
        let call = {
            let count = s.calls.entry(role).or_default();
            *count += 1;
            *count
        };
        let prompt: Vec<&str> = messages.iter().filter_map(|m| m.content.as_deref()).collect();
        s.prompts.insert(role, prompt.join("\n"));
        if s.fail {
            return Err(OrchError::ModelUnavailable("scripted outage".into()));
        }
        let scripted = s.scripts.get_mut(&role).and_then(|q| q.pop_front());
        let hook = s.after_call.clone();
        drop(s);
        let reply = scripted.unwrap_or_else(|| Self::default_reply(role, messages, call));
        if let Some(hook) = hook {
            hook(role, call);
        }
        Ok(reply)
    }
}

#[derive(Default)]
struct WorkspaceState {
    /// Files per branch.
    files: HashMap<String, BTreeMap<String, String>>,
    dirty: HashSet<String>,
    commits: u32,
}

/// Branch checkouts in memory; commits push `sha-<k>` to the fake host.
pub struct MemoryWorkspaces {
    host: Arc<FakeHost>,
    state: Arc<Mutex<WorkspaceState>>,
}

impl MemoryWorkspaces {
    pub fn new(host: Arc<FakeHost>) -> Self {
        Self {
            host,
            state: Arc::new(Mutex::new(WorkspaceState::default())),
        }
    }
}

#[async_trait]
impl WorkspaceProvider for MemoryWorkspaces {
    async fn prepare(&self, task: &Task) -> anyhow::Result<Box<dyn Workspace>> {
        let branch = task
            .branch
            .clone()
            .unwrap_or_else(|| branch_name(task.task_ref.number));
        Ok(Box::new(MemoryWorkspace {
            branch,
            host: self.host.clone(),
            state: self.state.clone(),
        }))
    }
}

pub struct MemoryWorkspace {
    branch: String,
    host: Arc<FakeHost>,
    state: Arc<Mutex<WorkspaceState>>,
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    fn branch(&self) -> &str {
        &self.branch
    }

    async fn list_files(&self, dir: Option<&str>) -> anyhow::Result<Vec<String>> {
        let s = self.state.lock().unwrap();
        let prefix = dir.map(|d| format!("{}/", d.trim_matches('/')));
        Ok(s.files
            .get(&self.branch)
            .map(|files| {
                files
                    .keys()
                    .filter(|f| prefix.as_ref().map_or(true, |p| f.starts_with(p)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        confine(Path::new("/"), path)?;
        let s = self.state.lock().unwrap();
        s.files
            .get(&self.branch)
            .and_then(|files| files.get(path))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("cannot read {path}: not found"))
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        confine(Path::new("/"), path)?;
        let mut s = self.state.lock().unwrap();
        s.files
            .entry(self.branch.clone())
            .or_default()
            .insert(path.to_string(), content.to_string());
        s.dirty.insert(self.branch.clone());
        Ok(())
    }

    async fn commit_and_push(&self, _message: &str) -> anyhow::Result<Option<String>> {
        let sha = {
            let mut s = self.state.lock().unwrap();
            if !s.dirty.remove(&self.branch) {
                return Ok(None);
            }
            s.commits += 1;
            format!("sha-{}", s.commits)
        };
        self.host.push_branch(&self.branch, &sha);
        Ok(Some(sha))
    }
}
