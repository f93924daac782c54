pub mod task;

use crate::config;
use crate::db::Db;
use crate::engine::tasks::TaskStore;
use std::sync::Arc;

/// Print version information.
pub fn version() {
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_desc = option_env!("SDLC_ORCH_GIT_DESCRIBE").unwrap_or("unknown");
    println!("sdlc-orch {pkg_version} ({git_desc})");
}

/// Print one config value.
pub fn config_get(key: &str) -> anyhow::Result<()> {
    let val = config::get(key)?;
    println!("{val}");
    Ok(())
}

/// Run one poll cycle and print what it did.
pub async fn tick() -> anyhow::Result<()> {
    let report = crate::engine::tick().await?;
    println!(
        "events: {}  jobs: {}  deferred: {}  failed repos: {}",
        report.events, report.spawned, report.deferred, report.failed_repos
    );
    Ok(())
}

/// Open the task store on the default database.
pub async fn open_store() -> anyhow::Result<TaskStore> {
    let db = Db::open(&crate::db::default_path()?)?;
    db.migrate().await?;
    Ok(TaskStore::new(Arc::new(db)))
}
