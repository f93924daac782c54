//! GitHub REST plumbing used by the GitHub code-host backend.

pub mod http;
pub mod types;
