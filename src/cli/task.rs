use super::open_store;
use crate::engine::tasks::{Phase, Task, TaskRef, Transition};
use anyhow::Context;
use std::fmt::Write as _;

/// List tracked tasks, optionally in one phase.
pub async fn list(phase: Option<String>) -> anyhow::Result<()> {
    let phase = phase.map(|p| p.parse::<Phase>()).transpose()?;
    let tasks = open_store().await?.list(phase).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }
    print!("{}", render_list(&tasks));
    Ok(())
}

/// Show one task in full.
pub async fn show(repo: &str, number: u64) -> anyhow::Result<()> {
    let task_ref = TaskRef::new(repo, number);
    let task = open_store()
        .await?
        .get(&task_ref)
        .await?
        .with_context(|| format!("task {task_ref} is not tracked"))?;
    print!("{}", render_task(&task));
    Ok(())
}

/// Print the phase transitions of one task.
pub async fn history(repo: &str, number: u64) -> anyhow::Result<()> {
    let task_ref = TaskRef::new(repo, number);
    let transitions = open_store().await?.history(&task_ref).await?;
    if transitions.is_empty() {
        println!("No transitions recorded for {task_ref}.");
        return Ok(());
    }
    print!("{}", render_history(&transitions));
    Ok(())
}

/// Count tasks per phase.
pub async fn status(json: bool) -> anyhow::Result<()> {
    let tasks = open_store().await?.list(None).await?;
    let counts: Vec<(Phase, usize)> = Phase::ALL
        .into_iter()
        .map(|p| (p, tasks.iter().filter(|t| t.phase == p).count()))
        .collect();

    if json {
        let map: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(p, c)| (p.as_str().to_string(), serde_json::Value::from(*c)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for (phase, count) in counts {
            println!("{:<20} {count}", phase.as_str());
        }
        println!("{:<20} {}", "total", tasks.len());
    }
    Ok(())
}

fn render_list(tasks: &[Task]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<28} {:<18} {:<10} {:<8} TITLE", "TASK", "PHASE", "DEV/REV", "PR");
    let _ = writeln!(out, "{}", "-".repeat(90));
    for task in tasks {
        let pr = task.pr_number.map(|n| format!("#{n}")).unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "{:<28} {:<18} {:<10} {:<8} {}",
            task.task_ref.to_string(),
            task.phase.as_str(),
            format!("{}/{}", task.dev_iterations, task.review_iterations),
            pr,
            task.title
        );
    }
    out
}

fn render_task(task: &Task) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Task: {}", task.task_ref);
    let _ = writeln!(out, "Title: {}", task.title);
    let _ = writeln!(out, "Phase: {}", task.phase);
    let _ = writeln!(
        out,
        "Iterations: plan {}, dev {}, review {}",
        task.plan_iterations, task.dev_iterations, task.review_iterations
    );
    if let Some(pr) = task.pr_number {
        let _ = writeln!(out, "PR: #{pr}{}", if task.superseded { " (superseded an earlier PR)" } else { "" });
    }
    if let Some(branch) = &task.branch {
        let _ = writeln!(out, "Branch: {branch}");
    }
    if let Some(sha) = &task.head_sha {
        let _ = writeln!(out, "Head: {sha} (CI {})", task.ci_status.as_str());
    }
    if let Some(role) = task.pending_role {
        let _ = writeln!(out, "Running: {role}");
    }
    if let Some(w) = &task.watermark {
        let _ = writeln!(out, "Last event: {} at {}", w.id, w.at.to_rfc3339());
    }
    if !task.labels.is_empty() {
        let labels: Vec<&str> = task.labels.iter().map(String::as_str).collect();
        let _ = writeln!(out, "Labels: {}", labels.join(", "));
    }
    let _ = writeln!(out, "Created: {}", task.created_at.to_rfc3339());
    let _ = writeln!(out, "Updated: {}", task.updated_at.to_rfc3339());
    if !task.feedback.is_empty() {
        let _ = writeln!(out, "\nOpen review feedback:");
        for item in &task.feedback {
            let _ = writeln!(out, "  - {item}");
        }
    }
    if let Some(plan) = &task.plan {
        let _ = writeln!(out, "\n{plan}");
    }
    out
}

fn render_history(transitions: &[Transition]) -> String {
    let mut out = String::new();
    for t in transitions {
        let _ = writeln!(
            out,
            "{}  {:<18} -> {:<18} {}",
            t.at.format("%Y-%m-%d %H:%M:%S"),
            t.from.as_str(),
            t.to.as_str(),
            t.reason
        );
    }
    out
}
