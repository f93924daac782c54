use async_trait::async_trait;
use serde_json::json;

use super::tools::{self, ToolStep};
use super::{base_vars, opening_messages, truncate, AgentBody, Step, MAX_PROMPT_SECTION};
use crate::backends::CodeHost;
use crate::engine::runner::workspace::Workspace;
use crate::engine::runner::{AgentContext, AgentRole, Artifact};
use crate::error::OrchError;
use crate::llm::{Message, Reply, ToolSpec};
use crate::template::Prompt;

/// Diagnoses failed checks and pushes a fix.
#[derive(Default)]
pub struct CiFixer {
    subject: String,
}

#[async_trait]
impl AgentBody for CiFixer {
    fn role(&self) -> AgentRole {
        AgentRole::CiFixer
    }

    fn tools(&self) -> Vec<ToolSpec> {
        tools::specs(json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "What changed"},
                "diagnosis": {"type": "string", "description": "Root cause of each failed check"},
            },
            "required": ["summary", "diagnosis"],
        }))
    }

    fn needs_workspace(&self) -> bool {
        true
    }

    async fn opening(&mut self, ctx: &AgentContext, host: &dyn CodeHost) -> anyhow::Result<Vec<Message>> {
        let task = &ctx.task;
        self.subject = format!("Fix CI for #{}", task.task_ref.number);

        let mut vars = base_vars(self.role(), ctx);
        vars.insert(
            "CI_SUMMARY".to_string(),
            ctx.note.clone().unwrap_or_else(|| "(no details reported)".to_string()),
        );
        if let Some(pr) = task.pr_number {
            match host.pull_request_diff(pr).await {
                Ok(diff) => {
                    vars.insert("DIFF".to_string(), truncate(&diff, MAX_PROMPT_SECTION));
                }
                Err(e) => tracing::warn!(task = %task.task_ref, pr, err = %e, "cannot fetch diff for ci fixer"),
            }
        }
        // The failed checks are already in the prompt
        let ctx = AgentContext {
            task: ctx.task.clone(),
            note: None,
        };
        opening_messages(self.role(), Prompt::CiFixer, &ctx, &vars)
    }

    async fn on_reply(&mut self, reply: Reply, ws: Option<&dyn Workspace>) -> Result<Step, OrchError> {
        let ws = ws.ok_or_else(|| OrchError::tool("ci fixer has no workspace"))?;
        match reply {
            Reply::ToolCalls(calls) => match tools::apply(calls, ws, &self.subject).await? {
                ToolStep::Continue(messages) => Ok(Step::Continue(messages)),
                ToolStep::Finished { change, call } => {
                    let diagnosis = call
                        .arg("diagnosis")
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .unwrap_or(change.summary.as_str())
                        .to_string();
                    Ok(Step::Done(Artifact::Fix { change, diagnosis }))
                }
            },
            Reply::Text(text) => Ok(Step::Continue(vec![
                Message::assistant(text),
                Message::user("Use the tools to fix the failing checks, then call finish."),
            ])),
        }
    }
}
