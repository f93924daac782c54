//! Agent bodies: the prompt building and reply handling of each role.
//!
//! The dispatcher owns the loop; a body only turns one model reply into
//! either more conversation or its final artifact.

mod ci_fixer;
mod coder;
mod planner;
mod reviewer;
mod tools;

use async_trait::async_trait;
use std::collections::HashMap;

use super::workspace::Workspace;
use super::{AgentContext, AgentRole, Artifact};
use crate::backends::CodeHost;
use crate::engine::budget::Ceilings;
use crate::error::OrchError;
use crate::llm::{Message, Reply, ToolSpec};
use crate::template::Prompt;

/// Diffs and issue bodies beyond this many bytes are cut.
const MAX_PROMPT_SECTION: usize = 60_000;

pub enum Step {
    /// Append these messages and call the model again.
    Continue(Vec<Message>),
    Done(Artifact),
}

#[async_trait]
pub trait AgentBody: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Tools offered to the model. Empty for text-only agents.
    fn tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    fn needs_workspace(&self) -> bool {
        false
    }

    /// System and user messages that open the conversation.
    async fn opening(&mut self, ctx: &AgentContext, host: &dyn CodeHost) -> anyhow::Result<Vec<Message>>;

    /// Handle one model turn. An `Err` ends the run as a failure.
    async fn on_reply(&mut self, reply: Reply, ws: Option<&dyn Workspace>) -> Result<Step, OrchError>;
}

pub fn body_for(role: AgentRole, ceilings: Ceilings) -> Box<dyn AgentBody> {
    match role {
        AgentRole::Planner => Box::new(planner::Planner),
        AgentRole::Coder => Box::new(coder::Coder::new(ceilings)),
        AgentRole::Reviewer => Box::new(reviewer::Reviewer::new(ceilings)),
        AgentRole::CiFixer => Box::new(ci_fixer::CiFixer::default()),
    }
}

/// Variables every prompt can use.
fn base_vars(role: AgentRole, ctx: &AgentContext) -> HashMap<String, String> {
    let task = &ctx.task;
    let mut vars = HashMap::new();
    vars.insert("ROLE".to_string(), role.as_str().replace('_', "-"));
    vars.insert("REPO".to_string(), task.task_ref.repo.clone());
    vars.insert("NUMBER".to_string(), task.task_ref.number.to_string());
    vars.insert("TITLE".to_string(), task.title.clone());
    if let Some(plan) = &task.plan {
        vars.insert("PLAN".to_string(), plan.clone());
    }
    vars
}

/// Render the system prompt and the role prompt, then append the command note.
fn opening_messages(
    role: AgentRole,
    prompt: Prompt,
    ctx: &AgentContext,
    vars: &HashMap<String, String>,
) -> anyhow::Result<Vec<Message>> {
    let system = Prompt::System.render(vars).map_err(anyhow::Error::msg)?;
    let user = prompt.render(vars).map_err(anyhow::Error::msg)?;
    let mut messages = vec![Message::system(system), Message::user(user)];
    if let Some(note) = ctx.note.as_deref().filter(|n| !n.trim().is_empty()) {
        let heading = match role {
            AgentRole::CiFixer => "Additional context",
            _ => "Additional instructions from the maintainer",
        };
        messages.push(Message::user(format!("{heading}:\n\n{note}")));
    }
    Ok(messages)
}

/// Cut `text` to at most `max` bytes on a char boundary.
fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n[truncated]", &text[..end])
}
