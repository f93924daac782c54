//! Agent dispatcher: runs one agent body as a bounded loop of model calls.
//!
//! Each iteration checks that the issue is still open, consumes one unit of
//! the per-run call budget, asks the model for a turn and hands the reply to
//! the agent body. The loop ends when the body produces its artifact, the
//! call budget runs out, a tool action fails, the issue is closed, or the
//! wall-clock timeout fires. Only terminal outcomes leave this module.

pub mod agents;
pub mod workspace;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use self::agents::Step;
use self::workspace::WorkspaceProvider;
use super::budget::{CallBudget, Ceilings, Consumption};
use super::tasks::Task;
use crate::backends::{CodeHost, Verdict};
use crate::error::OrchError;
use crate::llm::LanguageModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Coder,
    Reviewer,
    CiFixer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::CiFixer => "ci_fixer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "planner" => Ok(Self::Planner),
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "ci_fixer" | "cifixer" => Ok(Self::CiFixer),
            other => anyhow::bail!("unknown agent role: {other}"),
        }
    }
}

/// Commits pushed by a coding agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub branch: String,
    pub head_sha: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    pub summary: String,
    /// Blocking problems; empty on approval.
    pub issues: Vec<String>,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Plan(String),
    Change(ChangeSet),
    Fix { change: ChangeSet, diagnosis: String },
    Verdict(ReviewVerdict),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Success(Artifact),
    Failure(String),
    /// The per-run model-call budget ran out.
    BudgetExceeded,
    /// The issue was closed mid-run.
    Cancelled,
}

impl AgentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One agent invocation. Only logged; its effect survives through the task.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub role: AgentRole,
    pub started_at: DateTime<Utc>,
    pub model_call_count: u32,
    pub outcome: AgentOutcome,
}

/// Input of a run: the task snapshot plus the note of the command that
/// triggered it (or the CI summary for the CI fixer).
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub task: Task,
    pub note: Option<String>,
}

/// Runs agents for one repository.
pub struct Dispatcher {
    host: Arc<dyn CodeHost>,
    model: Arc<dyn LanguageModel>,
    workspaces: Arc<dyn WorkspaceProvider>,
    ceilings: Ceilings,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        host: Arc<dyn CodeHost>,
        model: Arc<dyn LanguageModel>,
        workspaces: Arc<dyn WorkspaceProvider>,
        ceilings: Ceilings,
        timeout: Duration,
    ) -> Self {
        Self {
            host,
            model,
            workspaces,
            ceilings,
            timeout,
        }
    }

    pub async fn run(&self, role: AgentRole, ctx: &AgentContext) -> AgentRun {
        let started_at = Utc::now();
        let mut calls = 0;
        tracing::info!(task = %ctx.task.task_ref, role = %role, "agent run started");

        let outcome = match tokio::time::timeout(self.timeout, self.drive(role, ctx, &mut calls)).await {
            Ok(outcome) => outcome,
            Err(_) => AgentOutcome::Failure(format!("timed out after {:?}", self.timeout)),
        };

        let elapsed = (Utc::now() - started_at).num_seconds();
        match &outcome {
            AgentOutcome::Success(_) | AgentOutcome::Cancelled => tracing::info!(
                task = %ctx.task.task_ref,
                role = %role,
                calls,
                elapsed,
                outcome = outcome.label(),
                "agent run finished"
            ),
            AgentOutcome::Failure(reason) => tracing::warn!(
                task = %ctx.task.task_ref,
                role = %role,
                calls,
                elapsed,
                reason,
                "agent run failed"
            ),
            AgentOutcome::BudgetExceeded => {
                let err = OrchError::BudgetExceeded {
                    counter: "agent_calls".into(),
                    ceiling: self.ceilings.agent_calls,
                };
                tracing::warn!(task = %ctx.task.task_ref, role = %role, calls, err = %err, "agent run stopped")
            }
        }

        AgentRun {
            role,
            started_at,
            model_call_count: calls,
            outcome,
        }
    }

    async fn drive(&self, role: AgentRole, ctx: &AgentContext, calls: &mut u32) -> AgentOutcome {
        let mut body = agents::body_for(role, self.ceilings);
        let number = ctx.task.task_ref.number;

        let workspace = if body.needs_workspace() {
            match self.workspaces.prepare(&ctx.task).await {
                Ok(ws) => Some(ws),
                Err(e) => return AgentOutcome::Failure(format!("workspace: {e:#}")),
            }
        } else {
            None
        };

        let mut messages = match body.opening(ctx, self.host.as_ref()).await {
            Ok(messages) => messages,
            Err(e) => return AgentOutcome::Failure(format!("cannot build prompt: {e:#}")),
        };
        let tools = body.tools();
        let mut budget = CallBudget::new(self.ceilings.agent_calls);

        loop {
            match self.host.is_open(number).await {
                Ok(true) => {}
                Ok(false) => return AgentOutcome::Cancelled,
                Err(e) => {
                    tracing::warn!(task = %ctx.task.task_ref, err = %e, "cannot check issue state, continuing");
                }
            }

            if let Consumption::Exhausted(_) = budget.try_consume() {
                return AgentOutcome::BudgetExceeded;
            }
            *calls = budget.used();

            let reply = match self.model.complete(&messages, &tools).await {
                Ok(reply) => reply,
                Err(e) => return AgentOutcome::Failure(e.to_string()),
            };

            match body.on_reply(reply, workspace.as_deref()).await {
                Ok(Step::Continue(more)) => messages.extend(more),
                Ok(Step::Done(artifact)) => return AgentOutcome::Success(artifact),
                Err(e) => return AgentOutcome::Failure(e.to_string()),
            }
        }
    }
}
