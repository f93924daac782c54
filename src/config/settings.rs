//! Typed settings assembled from config keys and environment overrides.

use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::engine::budget::Ceilings;

const DEFAULT_LLM_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Language-model client settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub url: String,
    pub token: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub retries: u32,
}

/// Everything the engine needs to start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub repos: Vec<String>,
    pub gh_token: Option<String>,
    pub poll_interval: Duration,
    pub max_parallel: usize,
    pub agent_timeout: Duration,
    pub initial_lookback: chrono::Duration,
    pub auto_code_after_plan: bool,
    pub reset_dev_on_new_pr: bool,
    pub ceilings: Ceilings,
    pub llm: LlmSettings,
    pub gh_retry: RetryPolicy,
    pub workspace_root: Option<std::path::PathBuf>,
}

impl Settings {
    /// Load from the process environment and the YAML config files.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(
            |name| std::env::var(name).ok().filter(|v| !v.is_empty()),
            |key| super::get(key).ok(),
        )
    }

    /// Assemble settings from an environment lookup and a config lookup.
    /// Environment variables win over config keys.
    pub fn from_lookup(
        env: impl Fn(&str) -> Option<String>,
        config: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let pick = |var: &str, key: &str| env(var).or_else(|| config(key));

        let mut repos = match env("GH_REPOSITORY") {
            Some(raw) => super::parse_list(&raw),
            None => config("repos").map(|r| super::parse_list(&r)).unwrap_or_default(),
        };
        if repos.is_empty() {
            if let Some(single) = config("repo") {
                repos.push(single);
            }
        }
        for repo in &repos {
            if repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
                anyhow::bail!("invalid repository '{repo}', expected owner/name");
            }
        }

        let poll_seconds: u64 = parse_or(pick("POLL_SECONDS", "engine.poll_seconds"), 15)?;
        let max_parallel: usize = parse_or(config("engine.max_parallel"), 4)?;
        let timeout_seconds: u64 = parse_or(config("engine.agent_timeout_seconds"), 1800)?;
        let lookback_hours: i64 = parse_or(config("engine.initial_lookback_hours"), 24)?;

        let ceilings = Ceilings {
            dev: parse_or(config("budget.dev"), 5)?,
            review: parse_or(config("budget.review"), 5)?,
            agent_calls: parse_or(config("budget.agent_calls"), 50)?,
        };

        let llm = LlmSettings {
            url: pick("LLM_API_URL", "llm.url").unwrap_or_else(|| DEFAULT_LLM_URL.to_string()),
            token: env("LLM_API_TOKEN"),
            model: pick("LLM_MODEL", "llm.model").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            max_tokens: parse_or(config("llm.max_tokens"), 4096)?,
            retries: parse_or(config("llm.retries"), 3)?,
        };

        let gh_retry = RetryPolicy {
            attempts: parse_or(config("gh.retries"), 3)?,
            base: Duration::from_secs(parse_or(config("gh.backoff.base_seconds"), 2)?),
            max: Duration::from_secs(parse_or(config("gh.backoff.max_seconds"), 60)?),
        };

        Ok(Self {
            repos,
            gh_token: env("GH_TOKEN").or_else(|| env("GITHUB_TOKEN")),
            poll_interval: Duration::from_secs(poll_seconds.max(1)),
            max_parallel: max_parallel.max(1),
            agent_timeout: Duration::from_secs(timeout_seconds),
            initial_lookback: chrono::Duration::hours(lookback_hours),
            auto_code_after_plan: parse_bool_or(
                pick("AUTO_CODE_AFTER_PLAN", "workflow.auto_code_after_plan"),
                true,
            )?,
            reset_dev_on_new_pr: parse_bool_or(config("workflow.reset_dev_on_new_pr"), true)?,
            ceilings,
            llm,
            gh_retry,
            workspace_root: config("workspace.root").map(std::path::PathBuf::from),
        })
    }
}

fn parse_or<T>(raw: Option<String>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value '{v}': {e}")),
    }
}

fn parse_bool_or(raw: Option<String>, default: bool) -> anyhow::Result<bool> {
    match raw.as_deref().map(|s| s.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("invalid boolean '{v}'"),
        },
    }
}
