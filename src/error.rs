//! Orchestration error taxonomy.
//!
//! Plumbing code returns `anyhow::Result`; these variants name the failure
//! classes the engine reacts to differently. Transient adapter and model
//! errors are retried below the engine and only reach it once the local
//! retry budget is spent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchError {
    /// The code host could not be reached. Retryable; the poll cursor is not advanced.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A dev/review/agent-call ceiling was reached.
    #[error("{counter} budget exceeded ({ceiling}/{ceiling})")]
    BudgetExceeded { counter: String, ceiling: u32 },

    /// An agent could not apply a tool action (patch, commit, push).
    #[error("tool failure: {0}")]
    ToolFailure(String),

    /// An event older than the task watermark or referencing a superseded sha.
    #[error("stale event {0}")]
    StaleEvent(String),

    /// The language model kept failing after local retries.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
}

impl OrchError {
    pub fn tool(err: impl std::fmt::Display) -> Self {
        Self::ToolFailure(err.to_string())
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_) | Self::ModelUnavailable(_))
    }
}
