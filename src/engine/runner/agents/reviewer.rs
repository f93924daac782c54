use async_trait::async_trait;
use serde::Deserialize;

use super::{base_vars, opening_messages, truncate, AgentBody, Step, MAX_PROMPT_SECTION};
use crate::backends::{CodeHost, Verdict};
use crate::engine::budget::Ceilings;
use crate::engine::runner::workspace::Workspace;
use crate::engine::runner::{AgentContext, AgentRole, Artifact, ReviewVerdict};
use crate::error::OrchError;
use crate::llm::{Message, Reply};
use crate::template::Prompt;

const FORMAT_REMINDER: &str = "Reply with a single JSON object: \
    {\"verdict\": \"approve\" | \"changes_requested\", \"summary\": \"...\", \"issues\": [\"...\"]}";

/// Reviews the PR diff and answers with a JSON verdict.
pub struct Reviewer {
    ceilings: Ceilings,
}

impl Reviewer {
    pub fn new(ceilings: Ceilings) -> Self {
        Self { ceilings }
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    issues: Vec<String>,
}

/// Pull the verdict object out of a reply, tolerating prose or code fences
/// around it.
fn parse_verdict(text: &str) -> Option<ReviewVerdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let raw: RawVerdict = serde_json::from_str(&text[start..=end]).ok()?;
    let verdict = match raw.verdict.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "approve" | "approved" => Verdict::Approve,
        "changes_requested" | "request_changes" => Verdict::RequestChanges,
        _ => return None,
    };
    let issues: Vec<String> = raw
        .issues
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect();
    Some(ReviewVerdict {
        verdict,
        summary: raw.summary.trim().to_string(),
        issues,
    })
}

#[async_trait]
impl AgentBody for Reviewer {
    fn role(&self) -> AgentRole {
        AgentRole::Reviewer
    }

    async fn opening(&mut self, ctx: &AgentContext, host: &dyn CodeHost) -> anyhow::Result<Vec<Message>> {
        let task = &ctx.task;
        let pr = task
            .pr_number
            .ok_or_else(|| anyhow::anyhow!("no pull request to review"))?;
        let issue = host.get_issue(task.task_ref.number).await?;
        let diff = host.pull_request_diff(pr).await?;

        let mut vars = base_vars(self.role(), ctx);
        vars.insert("BODY".to_string(), truncate(&issue.body, MAX_PROMPT_SECTION));
        vars.insert("DIFF".to_string(), truncate(&diff, MAX_PROMPT_SECTION));
        vars.insert("ITERATION".to_string(), task.review_iterations.to_string());
        vars.insert("MAX_ITERATIONS".to_string(), self.ceilings.review.to_string());
        if !task.feedback.is_empty() {
            let feedback: Vec<String> = task.feedback.iter().map(|f| format!("- {f}")).collect();
            vars.insert("FEEDBACK".to_string(), feedback.join("\n"));
        }
        opening_messages(self.role(), Prompt::Reviewer, ctx, &vars)
    }

    async fn on_reply(&mut self, reply: Reply, _ws: Option<&dyn Workspace>) -> Result<Step, OrchError> {
        match reply {
            Reply::Text(text) => match parse_verdict(&text) {
                Some(verdict) => Ok(Step::Done(Artifact::Verdict(verdict))),
                None => Ok(Step::Continue(vec![
                    Message::assistant(text),
                    Message::user(FORMAT_REMINDER),
                ])),
            },
            Reply::ToolCalls(_) => Ok(Step::Continue(vec![Message::user(FORMAT_REMINDER)])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_verdicts() {
        let v = parse_verdict(
            "Here you go:\n```json\n{\"verdict\": \"changes_requested\", \"summary\": \"nope\", \"issues\": [\"no tests\", \" \"]}\n```",
        )
        .unwrap();
        assert_eq!(v.verdict, Verdict::RequestChanges);
        assert_eq!(v.summary, "nope");
        assert_eq!(v.issues, vec!["no tests"]);

        let v = parse_verdict("{\"verdict\": \"approve\"}").unwrap();
        assert_eq!(v.verdict, Verdict::Approve);
        assert!(v.issues.is_empty());
    }

    #[test]
    fn rejects_unknown_or_missing_verdicts() {
        assert!(parse_verdict("looks good to me").is_none());
        assert!(parse_verdict("{\"verdict\": \"maybe\"}").is_none());
        assert!(parse_verdict("} {").is_none());
    }

    #[tokio::test]
    async fn malformed_reply_asks_for_json() {
        let mut reviewer = Reviewer::new(Ceilings::default());
        match reviewer.on_reply(Reply::Text("LGTM".into()), None).await.unwrap() {
            Step::Continue(messages) => {
                assert_eq!(messages.len(), 2);
                assert!(messages[1].content.as_deref().unwrap().contains("single JSON object"));
            }
            Step::Done(_) => panic!("accepted prose as a verdict"),
        }
    }
}
