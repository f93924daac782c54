//! Smoke tests for the `sdlc-orch` binary.
//!
//! Every test points `SDLC_ORCH_HOME` at a fresh temp dir and runs from it,
//! so no real config, database or token is touched.

use std::path::Path;
use std::process::{Command, Output};

fn run(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sdlc-orch"))
        .args(args)
        .current_dir(home)
        .env("SDLC_ORCH_HOME", home)
        .env_remove("GH_TOKEN")
        .env_remove("GITHUB_TOKEN")
        .env_remove("GH_REPOSITORY")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run sdlc-orch")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn version_prints_package_version() {
    let home = tempfile::tempdir().unwrap();
    let out = run(home.path(), &["version"]);
    assert!(out.status.success());
    assert!(stdout(&out).starts_with(&format!("sdlc-orch {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn config_reads_global_file() {
    let home = tempfile::tempdir().unwrap();
    std::fs::write(
        home.path().join("config.yml"),
        "engine:\n  poll_seconds: 30\nrepos:\n  - acme/widgets\n",
    )
    .unwrap();
    let out = run(home.path(), &["config", "engine.poll_seconds"]);
    assert!(out.status.success());
    assert_eq!(stdout(&out).trim(), "30");

    let out = run(home.path(), &["config", "engine.missing"]);
    assert!(!out.status.success());
}

#[test]
fn task_list_on_empty_database() {
    let home = tempfile::tempdir().unwrap();
    let out = run(home.path(), &["task", "list"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout(&out).trim(), "No tasks found.");
    assert!(home.path().join("orchestrator.db").exists());

    let out = run(home.path(), &["task", "list", "--phase", "nonsense"]);
    assert!(!out.status.success());
}

#[test]
fn task_status_json_counts_every_phase() {
    let home = tempfile::tempdir().unwrap();
    let out = run(home.path(), &["task", "status", "--json"]);
    assert!(out.status.success());
    let counts: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    let counts = counts.as_object().unwrap();
    assert_eq!(counts.len(), 10);
    assert_eq!(counts["awaiting_ci"], 0);
}

#[test]
fn tick_without_repositories_fails_cleanly() {
    let home = tempfile::tempdir().unwrap();
    let out = run(home.path(), &["tick"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("no repositories configured"));
}

#[test]
fn completions_are_generated() {
    let home = tempfile::tempdir().unwrap();
    let out = run(home.path(), &["completions", "bash"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("sdlc-orch"));
}
