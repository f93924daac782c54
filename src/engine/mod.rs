//! Engine: the polling loop that drives every tracked repository.
//!
//! The engine owns:
//! - One code-host handle and one agent dispatcher per repository
//! - The scheduler (poll, group, apply, dispatch)
//! - The serve loop (interval ticks, config reloads, signals)
//!
//! All task state lives in SQLite; the loop itself is stateless and can be
//! restarted at any point.

pub mod budget;
pub mod commands;
pub mod events;
pub mod ledger;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod tasks;

use crate::backends::github::GitHubBackend;
use crate::backends::CodeHost;
use crate::config::Settings;
use crate::db::Db;
use crate::llm::openai::OpenAiClient;
use crate::llm::LanguageModel;
use anyhow::Context;
use budget::IterationCounter;
use resolver::Resolver;
use runner::workspace::{GitWorkspaces, WorkspaceProvider};
use runner::Dispatcher;
use scheduler::{CycleReport, Pipeline, Scheduler};
use std::sync::Arc;
use std::time::Duration;

/// How long shutdown waits for in-flight task jobs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Wire the scheduler from settings: one pipeline per repository, sharing
/// the model client and the workspace root.
pub fn build(settings: &Settings, db: Arc<Db>) -> anyhow::Result<Arc<Scheduler>> {
    if settings.repos.is_empty() {
        anyhow::bail!(
            "no repositories configured; set 'repos' in ~/.sdlc-orch/config.yml or GH_REPOSITORY"
        );
    }
    let token = settings
        .gh_token
        .clone()
        .context("no GitHub token; set GH_TOKEN or GITHUB_TOKEN")?;

    let model: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(&settings.llm)?);
    let root = match &settings.workspace_root {
        Some(root) => root.clone(),
        None => crate::home::workspaces_dir()?,
    };
    let workspaces: Arc<dyn WorkspaceProvider> = Arc::new(GitWorkspaces::new(root, token.clone()));

    let mut pipelines = Vec::with_capacity(settings.repos.len());
    for repo in &settings.repos {
        let host: Arc<dyn CodeHost> = Arc::new(
            GitHubBackend::new(repo.clone(), token.clone(), settings.gh_retry)
                .with_context(|| format!("cannot set up GitHub client for {repo}"))?,
        );
        let dispatcher = Dispatcher::new(
            host.clone(),
            model.clone(),
            workspaces.clone(),
            settings.ceilings,
            settings.agent_timeout,
        );
        pipelines.push(Pipeline::new(host, dispatcher));
    }

    let resolver = Resolver::new(
        IterationCounter::new(settings.ceilings),
        settings.auto_code_after_plan,
        settings.reset_dev_on_new_pr,
    );
    Ok(Arc::new(Scheduler::new(
        db,
        pipelines,
        resolver,
        settings.max_parallel,
        settings.initial_lookback,
    )))
}

async fn open_db() -> anyhow::Result<Arc<Db>> {
    let db = Db::open(&crate::db::default_path()?)?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

/// Start the orchestrator service.
///
/// Called by `sdlc-orch serve`.
pub async fn serve() -> anyhow::Result<()> {
    tracing::info!("sdlc-orch engine starting");

    let settings = Settings::load()?;
    let db = open_db().await?;
    tracing::info!("internal database ready");

    let scheduler = build(&settings, db)?;
    for host in scheduler.hosts() {
        host.health_check()
            .await
            .with_context(|| format!("cannot reach {}", host.repo()))?;
        tracing::info!(backend = host.name(), repo = host.repo(), "backend connected");
    }

    let resumed = scheduler.recover().await?;
    if resumed > 0 {
        tracing::info!(count = resumed, "resumed interrupted agent runs");
    }

    let mut poll_interval = settings.poll_interval;
    tracing::info!(
        poll = ?poll_interval,
        parallel = settings.max_parallel,
        repos = ?scheduler.repos().collect::<Vec<_>>(),
        "entering main loop"
    );
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // SIGTERM handler (launchd/systemd send SIGTERM to stop services)
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut config_changes = crate::config::subscribe();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                scheduler.run_cycle().await;
            }
            changed = config_changes.recv() => {
                if changed.is_err() {
                    continue;
                }
                match Settings::load() {
                    Ok(fresh) if fresh.poll_interval != poll_interval => {
                        tracing::info!(old = ?poll_interval, new = ?fresh.poll_interval, "poll interval changed");
                        poll_interval = fresh.poll_interval;
                        interval = tokio::time::interval(poll_interval);
                        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    }
                    Ok(_) => tracing::debug!("config changed, poll interval unchanged"),
                    Err(e) => tracing::warn!(err = %e, "cannot reload config, keeping current settings"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Graceful shutdown: stop polling, let running jobs finish
    tracing::info!(grace = ?SHUTDOWN_GRACE, "draining task jobs...");
    if tokio::time::timeout(SHUTDOWN_GRACE, scheduler.drain()).await.is_err() {
        tracing::warn!("task jobs still running after grace period; they resume on next start");
    }
    tracing::info!("sdlc-orch engine stopped");
    Ok(())
}

/// Run a single poll cycle and wait for its jobs.
pub async fn tick() -> anyhow::Result<CycleReport> {
    let settings = Settings::load()?;
    let db = open_db().await?;
    let scheduler = build(&settings, db)?;
    scheduler.recover().await?;
    Ok(scheduler.tick().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(repos: &[&str], token: Option<&str>) -> Settings {
        let lookup = |_: &str| -> Option<String> { None };
        let mut s = Settings::from_lookup(lookup, lookup).unwrap();
        s.repos = repos.iter().map(|r| r.to_string()).collect();
        s.gh_token = token.map(String::from);
        s.llm.token = Some("llm-token".into());
        s.workspace_root = Some(std::env::temp_dir().join("sdlc-orch-test-ws"));
        s
    }

    async fn db() -> Arc<Db> {
        let db = Db::open_memory().unwrap();
        db.migrate().await.unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn build_requires_repos_and_token() {
        let err = build(&settings(&[], Some("t")), db().await).err().expect("build without repos succeeded");
        assert!(err.to_string().contains("no repositories"));
        let err = build(&settings(&["o/r"], None), db().await).err().expect("build without token succeeded");
        assert!(err.to_string().contains("GitHub token"));
    }

    #[tokio::test]
    async fn build_creates_one_pipeline_per_repo() {
        let scheduler = build(&settings(&["o/a", "o/b"], Some("t")), db().await).unwrap();
        let mut repos: Vec<_> = scheduler.repos().collect();
        repos.sort();
        assert_eq!(repos, vec!["o/a", "o/b"]);
    }
}
