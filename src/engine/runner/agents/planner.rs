use async_trait::async_trait;

use super::{base_vars, opening_messages, truncate, AgentBody, Step, MAX_PROMPT_SECTION};
use crate::backends::{CodeHost, Comment};
use crate::engine::events::{is_bot, is_orchestrator_comment};
use crate::engine::runner::workspace::Workspace;
use crate::engine::runner::{AgentContext, AgentRole, Artifact};
use crate::error::OrchError;
use crate::llm::{Message, Reply};
use crate::template::Prompt;

/// Turns an issue into a markdown plan. Text only.
pub struct Planner;

#[async_trait]
impl AgentBody for Planner {
    fn role(&self) -> AgentRole {
        AgentRole::Planner
    }

    async fn opening(&mut self, ctx: &AgentContext, host: &dyn CodeHost) -> anyhow::Result<Vec<Message>> {
        let number = ctx.task.task_ref.number;
        let issue = host.get_issue(number).await?;
        let comments = host.get_comments(number).await?;
        let mut vars = base_vars(self.role(), ctx);
        vars.insert("BODY".to_string(), truncate(&issue.body, MAX_PROMPT_SECTION));
        vars.insert(
            "DISCUSSION".to_string(),
            truncate(&discussion(&comments), MAX_PROMPT_SECTION),
        );
        opening_messages(self.role(), Prompt::Planner, ctx, &vars)
    }

    async fn on_reply(&mut self, reply: Reply, _ws: Option<&dyn Workspace>) -> Result<Step, OrchError> {
        match reply {
            Reply::Text(text) if !text.trim().is_empty() => {
                Ok(Step::Done(Artifact::Plan(text.trim().to_string())))
            }
            Reply::Text(_) => Ok(Step::Continue(vec![Message::user(
                "The plan was empty. Reply with the plan in markdown.",
            )])),
            Reply::ToolCalls(_) => Ok(Step::Continue(vec![Message::user(
                "No tools are available. Reply with the plan in markdown.",
            )])),
        }
    }
}

/// Human comments on the issue, oldest first.
fn discussion(comments: &[Comment]) -> String {
    comments
        .iter()
        .filter(|c| !is_bot(&c.author) && !is_orchestrator_comment(&c.body))
        .map(|c| format!("**{}**: {}", c.author, c.body.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
