//! Workspace tools shared by the coder and the CI fixer.

use serde_json::json;

use crate::engine::runner::workspace::Workspace;
use crate::engine::runner::ChangeSet;
use crate::error::OrchError;
use crate::llm::{Message, ToolCall, ToolSpec};

/// Tool results longer than this are cut before going back to the model.
const MAX_TOOL_OUTPUT: usize = 40_000;

pub const FINISH: &str = "finish";

pub fn specs(finish_params: serde_json::Value) -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "list_files".into(),
            description: "List repository files, optionally under a directory.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"dir": {"type": "string", "description": "Directory relative to the repository root"}},
            }),
        },
        ToolSpec {
            name: "read_file".into(),
            description: "Read one file.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        },
        ToolSpec {
            name: "write_file".into(),
            description: "Replace the content of one file, creating it if needed.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
                "required": ["path", "content"],
            }),
        },
        ToolSpec {
            name: FINISH.into(),
            description: "Commit every change and push the branch. Call once, at the end.".into(),
            parameters: finish_params,
        },
    ]
}

pub enum ToolStep {
    Continue(Vec<Message>),
    /// `finish` pushed a commit; carries the finish call for its arguments.
    Finished { change: ChangeSet, call: ToolCall },
}

/// Execute a batch of tool calls in order.
///
/// File errors go back to the model as tool results. A failed commit or push
/// ends the run.
pub async fn apply(calls: Vec<ToolCall>, ws: &dyn Workspace, subject: &str) -> Result<ToolStep, OrchError> {
    let mut messages = vec![Message::assistant_calls(calls.clone())];
    for call in calls {
        let result = match call.name.as_str() {
            "list_files" => ws
                .list_files(call.arg("dir"))
                .await
                .map(|files| if files.is_empty() { "(no files)".to_string() } else { files.join("\n") }),
            "read_file" => match call.arg("path") {
                Some(path) => ws.read_file(path).await,
                None => Err(anyhow::anyhow!("missing argument: path")),
            },
            "write_file" => match (call.arg("path"), call.arg("content")) {
                (Some(path), Some(content)) => ws.write_file(path, content).await.map(|()| format!("wrote {path}")),
                _ => Err(anyhow::anyhow!("missing argument: path and content are required")),
            },
            FINISH => {
                let summary = call.arg("summary").unwrap_or("").trim().to_string();
                let message = if summary.is_empty() {
                    subject.to_string()
                } else {
                    format!("{subject}\n\n{summary}")
                };
                match ws.commit_and_push(&message).await {
                    Ok(Some(head_sha)) => {
                        return Ok(ToolStep::Finished {
                            change: ChangeSet {
                                branch: ws.branch().to_string(),
                                head_sha,
                                summary,
                            },
                            call,
                        });
                    }
                    Ok(None) => Ok("nothing to commit: change files with write_file before calling finish".to_string()),
                    Err(e) => return Err(OrchError::tool(format!("{e:#}"))),
                }
            }
            other => Err(anyhow::anyhow!("unknown tool: {other}")),
        };
        let content = match result {
            Ok(out) => cut(out),
            Err(e) => format!("error: {e:#}"),
        };
        messages.push(Message::tool_result(&call.id, content));
    }
    Ok(ToolStep::Continue(messages))
}

fn cut(mut out: String) -> String {
    if out.len() > MAX_TOOL_OUTPUT {
        let mut end = MAX_TOOL_OUTPUT;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
        out.push_str("\n[output truncated]");
    }
    out
}
