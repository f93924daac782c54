//! Home directory utilities.
//!
//! All durable state (database, global config, workspaces) lives under
//! `~/.sdlc-orch/`, or under `$SDLC_ORCH_HOME` when that is set.

use std::path::PathBuf;

/// The home directory name.
const HOME_DIR: &str = ".sdlc-orch";

/// Environment override for the home directory.
const HOME_ENV: &str = "SDLC_ORCH_HOME";

/// Get the orchestrator home directory path, creating it if needed.
pub fn orch_home() -> anyhow::Result<PathBuf> {
    let path = match std::env::var_os(HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?
            .join(HOME_DIR),
    };

    if !path.exists() {
        std::fs::create_dir_all(&path)?;
        tracing::debug!(path = %path.display(), "created orchestrator home");
    }

    Ok(path)
}

/// Default root for per-task repository checkouts.
pub fn workspaces_dir() -> anyhow::Result<PathBuf> {
    Ok(orch_home()?.join("workspaces"))
}

/// Global config path: `~/.sdlc-orch/config.yml`.
pub fn global_config_path() -> anyhow::Result<PathBuf> {
    Ok(orch_home()?.join("config.yml"))
}
