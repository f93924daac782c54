//! Config reader: loads YAML config files and resolves dot-separated keys.
//!
//! Reads `~/.sdlc-orch/config.yml` (global) and `.sdlc-orch.yml` (project).
//! Project config overrides global config for the same key.
//!
//! Parsed files are cached for the process lifetime; a `notify` watcher
//! invalidates the cache when a file changes and broadcasts the change to
//! subscribers (the serve loop uses it to pick up a new poll interval).

mod settings;

pub use settings::{LlmSettings, Settings};

use anyhow::Context;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Project-level config file name, looked up in the current directory.
const PROJECT_FILE: &str = ".sdlc-orch.yml";

/// Global config file name inside the orchestrator home.
const GLOBAL_FILE: &str = "config.yml";

/// Cached YAML values, parsed once per file.
static CACHE: std::sync::LazyLock<RwLock<HashMap<PathBuf, serde_yml::Value>>> =
    std::sync::LazyLock::new(|| RwLock::new(HashMap::new()));

/// Files currently being watched for changes.
static WATCHED: std::sync::LazyLock<RwLock<HashMap<PathBuf, ()>>> =
    std::sync::LazyLock::new(|| RwLock::new(HashMap::new()));

/// Global file watcher instance (started on first use).
static FILE_WATCHER: std::sync::LazyLock<Arc<Mutex<Option<RecommendedWatcher>>>> =
    std::sync::LazyLock::new(|| Arc::new(Mutex::new(None)));

/// Broadcast sender for config change notifications.
static CHANGE_TX: std::sync::LazyLock<broadcast::Sender<PathBuf>> =
    std::sync::LazyLock::new(|| {
        let (tx, _) = broadcast::channel(16);
        tx
    });

/// Subscribe to config change notifications.
///
/// The receiver yields the path of each changed config file.
pub fn subscribe() -> broadcast::Receiver<PathBuf> {
    CHANGE_TX.subscribe()
}

/// Invalidate the cache entry for a config file and notify subscribers.
fn invalidate_cache(path: &PathBuf) {
    if let Ok(mut cache) = CACHE.write() {
        cache.remove(path);
        tracing::debug!("config cache invalidated for: {}", path.display());
    }
    // No receivers is fine
    let _ = CHANGE_TX.send(path.clone());
}

/// Start the file watcher if not already running.
fn ensure_watcher() {
    let Ok(mut watcher_guard) = FILE_WATCHER.lock() else {
        return;
    };
    if watcher_guard.is_some() {
        return;
    }

    let watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if filename == GLOBAL_FILE || filename == PROJECT_FILE {
                        invalidate_cache(&path);
                    }
                }
            }
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    );

    match watcher {
        Ok(w) => *watcher_guard = Some(w),
        Err(e) => tracing::warn!(err = %e, "config watcher unavailable, hot reload disabled"),
    }
}

/// Watch a config file for changes.
fn watch_file(path: &PathBuf) {
    ensure_watcher();

    if let Ok(mut watched) = WATCHED.write() {
        if watched.contains_key(path) {
            return;
        }
        watched.insert(path.clone(), ());

        if let Ok(mut guard) = FILE_WATCHER.lock() {
            if let Some(ref mut watcher) = *guard {
                if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                    tracing::debug!(path = %path.display(), err = %e, "cannot watch config file");
                } else {
                    tracing::debug!("now watching config file: {}", path.display());
                }
            }
        }
    }
}

/// Config files in lookup order: project first, then global.
fn config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(PROJECT_FILE)];
    if let Ok(global) = crate::home::global_config_path() {
        paths.push(global);
    }
    paths
}

/// Get a config value by dot-separated key (e.g. "engine.poll_seconds").
///
/// Lookup order:
/// 1. `.sdlc-orch.yml` in the current directory (project config)
/// 2. `~/.sdlc-orch/config.yml` (global config)
///
/// Scalars are returned as strings; sequences and maps as YAML text.
pub fn get(key: &str) -> anyhow::Result<String> {
    let value = get_value(key)?;
    render_value(&value)
}

/// Get the raw YAML value for a dot-separated key.
pub fn get_value(key: &str) -> anyhow::Result<serde_yml::Value> {
    for path in config_paths() {
        if !path.exists() {
            continue;
        }
        if let Ok(value) = resolve_key(&path, key) {
            return Ok(value);
        }
    }
    anyhow::bail!("config key not found: {key}")
}

/// Resolve a dot-separated key from a YAML file, caching the parsed file.
fn resolve_key(path: &PathBuf, key: &str) -> anyhow::Result<serde_yml::Value> {
    watch_file(path);

    if let Ok(cache) = CACHE.read() {
        if let Some(cached) = cache.get(path) {
            return extract_value(cached, key);
        }
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: serde_yml::Value =
        serde_yml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

    if let Ok(mut cache) = CACHE.write() {
        cache.insert(path.clone(), parsed.clone());
    }

    extract_value(&parsed, key)
}

/// Extract a value from a YAML tree by dot-separated key.
fn extract_value(root: &serde_yml::Value, key: &str) -> anyhow::Result<serde_yml::Value> {
    let mut current = root;
    for part in key.split('.') {
        current = current
            .get(part)
            .with_context(|| format!("key not found: {key}"))?;
    }
    Ok(current.clone())
}

fn render_value(value: &serde_yml::Value) -> anyhow::Result<String> {
    match value {
        serde_yml::Value::String(s) => Ok(s.clone()),
        serde_yml::Value::Number(n) => Ok(n.to_string()),
        serde_yml::Value::Bool(b) => Ok(b.to_string()),
        serde_yml::Value::Null => Ok(String::new()),
        other => Ok(serde_yml::to_string(other)?),
    }
}

/// Parse a list setting: a YAML sequence, or a comma-separated string.
pub fn parse_list(raw: &str) -> Vec<String> {
    if let Ok(items) = serde_yml::from_str::<Vec<String>>(raw) {
        return items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
