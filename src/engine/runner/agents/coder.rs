use async_trait::async_trait;
use serde_json::json;

use super::tools::{self, ToolStep};
use super::{base_vars, opening_messages, truncate, AgentBody, Step, MAX_PROMPT_SECTION};
use crate::backends::CodeHost;
use crate::engine::budget::Ceilings;
use crate::engine::runner::workspace::Workspace;
use crate::engine::runner::{AgentContext, AgentRole, Artifact};
use crate::error::OrchError;
use crate::llm::{Message, Reply, ToolSpec};
use crate::template::Prompt;

/// Implements the plan (and review feedback) through workspace tools.
pub struct Coder {
    ceilings: Ceilings,
    subject: String,
}

impl Coder {
    pub fn new(ceilings: Ceilings) -> Self {
        Self {
            ceilings,
            subject: String::new(),
        }
    }
}

#[async_trait]
impl AgentBody for Coder {
    fn role(&self) -> AgentRole {
        AgentRole::Coder
    }

    fn tools(&self) -> Vec<ToolSpec> {
        tools::specs(json!({
            "type": "object",
            "properties": {"summary": {"type": "string", "description": "What changed"}},
            "required": ["summary"],
        }))
    }

    fn needs_workspace(&self) -> bool {
        true
    }

    async fn opening(&mut self, ctx: &AgentContext, host: &dyn CodeHost) -> anyhow::Result<Vec<Message>> {
        let task = &ctx.task;
        let issue = host.get_issue(task.task_ref.number).await?;
        self.subject = format!("{} (#{})", task.title, task.task_ref.number);

        let mut vars = base_vars(self.role(), ctx);
        vars.insert("BODY".to_string(), truncate(&issue.body, MAX_PROMPT_SECTION));
        if !task.feedback.is_empty() {
            let feedback: Vec<String> = task.feedback.iter().map(|f| format!("- {f}")).collect();
            vars.insert("FEEDBACK".to_string(), feedback.join("\n"));
            vars.insert("ITERATION".to_string(), task.dev_iterations.to_string());
            vars.insert("MAX_ITERATIONS".to_string(), self.ceilings.dev.to_string());
        }
        opening_messages(self.role(), Prompt::Coder, ctx, &vars)
    }

    async fn on_reply(&mut self, reply: Reply, ws: Option<&dyn Workspace>) -> Result<Step, OrchError> {
        let ws = ws.ok_or_else(|| OrchError::tool("coder has no workspace"))?;
        match reply {
            Reply::ToolCalls(calls) => match tools::apply(calls, ws, &self.subject).await? {
                ToolStep::Continue(messages) => Ok(Step::Continue(messages)),
                ToolStep::Finished { change, .. } => Ok(Step::Done(Artifact::Change(change))),
            },
            Reply::Text(text) => Ok(Step::Continue(vec![
                Message::assistant(text),
                Message::user("Use the tools to make the change, then call finish."),
            ])),
        }
    }
}
