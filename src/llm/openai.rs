//! OpenAI-compatible chat-completions client with tool calling.
//!
//! Works against any endpoint that speaks the `/chat/completions` dialect
//! (OpenRouter by default).

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{LanguageModel, Message, Reply, Role, ToolCall, ToolSpec};
use crate::backoff::{is_transient, RetryPolicy};
use crate::config::LlmSettings;
use crate::error::OrchError;

pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    token: String,
    model: String,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(settings: &LlmSettings) -> anyhow::Result<Self> {
        let token = settings
            .token
            .clone()
            .context("LLM_API_TOKEN is not set")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            url: format!("{}/chat/completions", settings.url.trim_end_matches('/')),
            token,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            retry: RetryPolicy {
                attempts: settings.retries.max(1),
                ..RetryPolicy::default()
            },
        })
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSpec]) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages.iter().map(wire_message).collect();
        let mut body = serde_json::json!({
            "model": &self.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }

    async fn send_once(&self, body: &serde_json::Value) -> anyhow::Result<ChatResponse> {
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("LLM API POST {} failed ({status}): {text}", self.url);
        }
        resp.json::<ChatResponse>()
            .await
            .context("parsing chat completion response")
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Reply, OrchError> {
        let body = self.request_body(messages, tools);
        let this = self;
        let body_ref = &body;
        let resp = self
            .retry
            .run("chat completion", is_transient, move || this.send_once(body_ref))
            .await
            .map_err(|e| OrchError::ModelUnavailable(format!("{e:#}")))?;
        parse_reply(resp).map_err(|e| OrchError::ModelUnavailable(format!("{e:#}")))
    }
}

// ── Wire format ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireReply,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object.
    arguments: String,
}

fn wire_message(m: &Message) -> serde_json::Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut out = serde_json::json!({ "role": role, "content": m.content });
    if !m.tool_calls.is_empty() {
        out["tool_calls"] = m
            .tool_calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments.to_string() },
                })
            })
            .collect();
    }
    if let Some(id) = &m.tool_call_id {
        out["tool_call_id"] = serde_json::Value::String(id.clone());
    }
    out
}

fn parse_reply(resp: ChatResponse) -> anyhow::Result<Reply> {
    let message = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .context("chat completion returned no choices")?;

    if !message.tool_calls.is_empty() {
        let calls = message
            .tool_calls
            .into_iter()
            .map(|c| {
                let arguments = if c.function.arguments.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&c.function.arguments)
                        .with_context(|| format!("tool call {} has malformed arguments", c.function.name))?
                };
                Ok(ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        return Ok(Reply::ToolCalls(calls));
    }

    Ok(Reply::Text(message.content.unwrap_or_default()))
}
