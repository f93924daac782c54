//! State resolver: the SDLC state machine.
//!
//! Pure functions over a `Task`. `on_event` handles a host event,
//! `on_outcome` handles a finished agent run. Both mutate the task in place
//! (phase, counters, pending dispatch) and return the host-side effects the
//! scheduler must apply once the new state is committed. Counter
//! consumption happens here, so it commits in the same transaction as the
//! decision that needed it.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::budget::{Consumption, Counter, IterationCounter};
use super::commands::Command;
use super::events::{EventKind, Event, CI_FIX_MARKER, PLAN_MARKER, REVIEW_MARKER, STATUS_MARKER};
use super::runner::{AgentOutcome, AgentRole, AgentRun, Artifact, ChangeSet, ReviewVerdict};
use super::tasks::{CiStatus, Phase, Task};
use crate::backends::{PrDraft, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Valid event, nothing to do in the current phase.
    Ignored,
    /// References a superseded commit.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Issue,
    PullRequest,
}

/// A host write decided by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Comment { target: Target, body: String },
    Review { verdict: Verdict, body: String },
    OpenOrUpdatePr(PrDraft),
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub disposition: Disposition,
    pub reason: String,
    /// Phase changes in order, for the audit log.
    pub transitions: Vec<(Phase, Phase, String)>,
    pub effects: Vec<Effect>,
    /// Agent to run next; mirrors `task.pending_role`.
    pub dispatch: Option<AgentRole>,
}

impl Resolution {
    fn new(disposition: Disposition, reason: impl Into<String>) -> Self {
        Self {
            disposition,
            reason: reason.into(),
            transitions: Vec::new(),
            effects: Vec::new(),
            dispatch: None,
        }
    }

    fn applied(reason: impl Into<String>) -> Self {
        Self::new(Disposition::Applied, reason)
    }

    fn ignored(reason: impl Into<String>) -> Self {
        Self::new(Disposition::Ignored, reason)
    }

    fn stale(reason: impl Into<String>) -> Self {
        Self::new(Disposition::Stale, reason)
    }

    fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }
}

/// The counter a dispatch of `role` consumes.
pub fn counter_for(role: AgentRole) -> Counter {
    match role {
        AgentRole::Planner => Counter::Plan,
        AgentRole::Coder | AgentRole::CiFixer => Counter::Dev,
        AgentRole::Reviewer => Counter::Review,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    counter: IterationCounter,
    auto_code_after_plan: bool,
    reset_dev_on_new_pr: bool,
}

impl Resolver {
    pub fn new(counter: IterationCounter, auto_code_after_plan: bool, reset_dev_on_new_pr: bool) -> Self {
        Self {
            counter,
            auto_code_after_plan,
            reset_dev_on_new_pr,
        }
    }

    pub fn on_event(&self, task: &mut Task, event: &Event, now: DateTime<Utc>) -> Resolution {
        let mut res = if task.phase.is_terminal() {
            Resolution::ignored(format!("task already {}", task.phase))
        } else {
            match &event.kind {
                EventKind::IssueCreated { title, labels } => {
                    if task.phase != Phase::New {
                        Resolution::ignored("issue already tracked")
                    } else {
                        task.title = title.clone();
                        task.labels.extend(labels.iter().cloned());
                        let mut res = Resolution::applied("issue opened");
                        self.start_planner(task, None, &mut res);
                        res
                    }
                }
                EventKind::Command(Command::Plan(note)) => match task.phase {
                    Phase::New | Phase::Planning | Phase::PlanReady => {
                        let mut res = Resolution::applied("/plan");
                        self.start_planner(task, note.clone(), &mut res);
                        res
                    }
                    phase => Resolution::ignored(format!("/plan ignored in {phase}")),
                },
                EventKind::Command(Command::Code(note)) => {
                    let allowed = match task.phase {
                        Phase::PlanReady | Phase::Coding | Phase::CiFailed | Phase::ChangesRequested => true,
                        Phase::AwaitingCi | Phase::ReviewPending => task.superseded || task.pr_number.is_none(),
                        _ => false,
                    };
                    if allowed {
                        let mut res = Resolution::applied("/code");
                        self.start_coder(task, note.clone(), &mut res);
                        res
                    } else {
                        Resolution::ignored(format!("/code ignored in {}", task.phase))
                    }
                }
                EventKind::PrUpdated { pr, sha, branch } => self.on_pr_updated(task, *pr, sha, branch),
                EventKind::CiCompleted {
                    sha,
                    success,
                    summary,
                    ..
                } => self.on_ci_completed(task, sha, *success, summary),
            }
        };
        if res.disposition == Disposition::Applied {
            task.updated_at = now;
        }
        res.dispatch = task.pending_role;
        res
    }

    pub fn on_outcome(&self, task: &mut Task, run: &AgentRun, now: DateTime<Utc>) -> Resolution {
        task.pending_role = None;
        task.pending_note = None;
        task.updated_at = now;

        let mut res = match &run.outcome {
            AgentOutcome::Cancelled => {
                self.counter.refund(task, counter_for(run.role));
                Resolution::applied(format!("{} cancelled: issue closed", run.role))
            }
            AgentOutcome::BudgetExceeded => self.failed(task, run.role, "agent-call-budget-exceeded"),
            AgentOutcome::Failure(reason) => self.failed(task, run.role, reason),
            AgentOutcome::Success(artifact) => match (run.role, artifact) {
                (AgentRole::Planner, Artifact::Plan(plan)) => self.plan_ready(task, plan),
                (AgentRole::Coder, Artifact::Change(change)) => {
                    let mut res = Resolution::applied("coder pushed changes");
                    self.await_ci(task, change, &mut res);
                    res
                }
                (AgentRole::CiFixer, Artifact::Fix { change, diagnosis }) => {
                    let mut res = Resolution::applied("ci fix pushed");
                    self.await_ci(task, change, &mut res);
                    res.effect(Effect::Comment {
                        target: Target::PullRequest,
                        body: format!(
                            "{CI_FIX_MARKER}\n## CI fix\n\n**Diagnosis:** {diagnosis}\n\n**Change:** {}\n\nPushed `{}`.",
                            change.summary, change.head_sha
                        ),
                    });
                    res
                }
                (AgentRole::Reviewer, Artifact::Verdict(verdict)) => self.reviewed(task, verdict),
                (role, _) => self.failed(task, role, "unexpected artifact"),
            },
        };
        res.dispatch = task.pending_role;
        res
    }

    fn enter(task: &mut Task, phase: Phase, reason: &str, res: &mut Resolution) {
        if task.phase != phase {
            res.transitions.push((task.phase, phase, reason.to_string()));
            task.phase = phase;
        }
    }

    fn start_planner(&self, task: &mut Task, note: Option<String>, res: &mut Resolution) {
        // uncapped
        self.counter.try_consume(task, Counter::Plan);
        Self::enter(task, Phase::Planning, &res.reason.clone(), res);
        task.pending_role = Some(AgentRole::Planner);
        task.pending_note = note;
    }

    fn start_coder(&self, task: &mut Task, note: Option<String>, res: &mut Resolution) {
        match self.counter.try_consume(task, Counter::Dev) {
            Consumption::Allowed(_) => {
                Self::enter(task, Phase::Coding, &res.reason.clone(), res);
                task.superseded = false;
                task.pending_role = Some(AgentRole::Coder);
                task.pending_note = note;
            }
            Consumption::Exhausted(ceiling) => self.force(task, Counter::Dev, ceiling, res),
        }
    }

    /// Terminal outcome of an exhausted budget.
    fn force(&self, task: &mut Task, counter: Counter, ceiling: u32, res: &mut Resolution) {
        let reason = format!("{counter} budget exhausted ({ceiling}/{ceiling})");
        Self::enter(task, Phase::ForcedApproved, &reason, res);
        task.pending_role = None;
        task.pending_note = None;
        let warning = format!(
            "{STATUS_MARKER}\n## Forced approval\n\n\
             **Warning:** the {counter} iteration budget is exhausted ({ceiling}/{ceiling}). \
             The change is approved without a clean review and needs a human check before merging."
        );
        res.effect(Effect::Comment {
            target: Target::Issue,
            body: warning.clone(),
        });
        if task.pr_number.is_some() {
            res.effect(Effect::Review {
                verdict: Verdict::Approve,
                body: warning,
            });
        }
        res.reason = reason;
    }

    fn failed(&self, task: &mut Task, role: AgentRole, reason: &str) -> Resolution {
        let retry = match task.phase {
            Phase::Planning => " Comment `/plan` to retry.",
            Phase::Coding | Phase::CiFailed | Phase::ChangesRequested => " Comment `/code` to retry.",
            _ => "",
        };
        let mut res = Resolution::applied(format!("{role} failed: {reason}"));
        res.effect(Effect::Comment {
            target: Target::Issue,
            body: format!(
                "{STATUS_MARKER}\nThe **{role}** agent failed: {reason}\n\nThe task stays in `{}`.{retry}",
                task.phase
            ),
        });
        res
    }

    fn plan_ready(&self, task: &mut Task, plan: &str) -> Resolution {
        let mut res = Resolution::applied("plan posted");
        task.plan = Some(plan.to_string());
        Self::enter(task, Phase::PlanReady, "plan posted", &mut res);
        res.effect(Effect::Comment {
            target: Target::Issue,
            body: format!(
                "{PLAN_MARKER}\n## Implementation plan\n\n{plan}\n\nComment `/code` to start implementation or `/plan` to revise."
            ),
        });
        if self.auto_code_after_plan {
            res.reason = "plan posted, coding".into();
            self.start_coder(task, None, &mut res);
        }
        res
    }

    fn await_ci(&self, task: &mut Task, change: &ChangeSet, res: &mut Resolution) {
        task.branch = Some(change.branch.clone());
        task.head_sha = Some(change.head_sha.clone());
        task.ci_status = CiStatus::Pending;
        task.superseded = false;
        Self::enter(task, Phase::AwaitingCi, &res.reason.clone(), res);
        let number = task.task_ref.number;
        let summary = if change.summary.is_empty() {
            String::new()
        } else {
            format!("\n\n{}", change.summary)
        };
        res.effect(Effect::OpenOrUpdatePr(PrDraft {
            branch: change.branch.clone(),
            title: format!("{} (#{number})", task.title),
            body: format!("Closes #{number}{summary}"),
        }));
    }

    fn reviewed(&self, task: &mut Task, verdict: &ReviewVerdict) -> Resolution {
        let ceiling = self.counter.ceiling(Counter::Review).unwrap_or(u32::MAX);
        let body = review_body(verdict, task.review_iterations, ceiling);
        match verdict.verdict {
            Verdict::Approve => {
                let mut res = Resolution::applied("review approved");
                Self::enter(task, Phase::Approved, "review approved", &mut res);
                res.effect(Effect::Review {
                    verdict: Verdict::Approve,
                    body,
                });
                res
            }
            Verdict::RequestChanges => {
                let mut res = Resolution::applied("changes requested");
                task.feedback = if verdict.issues.is_empty() {
                    vec![verdict.summary.clone()]
                } else {
                    verdict.issues.clone()
                };
                Self::enter(task, Phase::ChangesRequested, "changes requested", &mut res);
                res.effect(Effect::Review {
                    verdict: Verdict::RequestChanges,
                    body,
                });
                if self.counter.is_exhausted(task, Counter::Review) {
                    self.force(task, Counter::Review, ceiling, &mut res);
                } else {
                    self.start_coder(task, None, &mut res);
                }
                res
            }
        }
    }

    fn on_pr_updated(&self, task: &mut Task, pr: u64, sha: &str, branch: &str) -> Resolution {
        if task.pr_number == Some(pr) && task.head_sha.as_deref() == Some(sha) {
            return Resolution::ignored("pull request head unchanged");
        }
        let mut res = Resolution::applied(format!("PR #{pr} at {sha}"));
        if task.pr_number.is_some_and(|current| current != pr) {
            task.superseded = true;
            if self.reset_dev_on_new_pr {
                task.dev_iterations = 0;
            }
            res.reason = format!("PR #{pr} supersedes #{}", task.pr_number.unwrap_or_default());
        }
        task.pr_number = Some(pr);
        task.branch = Some(branch.to_string());
        if task.head_sha.as_deref() != Some(sha) {
            task.head_sha = Some(sha.to_string());
            task.ci_status = CiStatus::Pending;
            if matches!(task.phase, Phase::CiFailed | Phase::ReviewPending) {
                Self::enter(task, Phase::AwaitingCi, "new commits pushed", &mut res);
            }
        }
        res
    }

    fn on_ci_completed(&self, task: &mut Task, sha: &str, success: bool, summary: &str) -> Resolution {
        if task.head_sha.as_deref() != Some(sha) {
            return Resolution::stale(format!(
                "ci for {sha}, head is {}",
                task.head_sha.as_deref().unwrap_or("unknown")
            ));
        }
        if !matches!(task.phase, Phase::AwaitingCi | Phase::CiFailed | Phase::ReviewPending) {
            return Resolution::ignored(format!("ci result ignored in {}", task.phase));
        }
        if success {
            task.ci_status = CiStatus::Success;
            let mut res = Resolution::applied("ci passed");
            match self.counter.try_consume(task, Counter::Review) {
                Consumption::Allowed(_) => {
                    Self::enter(task, Phase::ReviewPending, "ci passed", &mut res);
                    task.pending_role = Some(AgentRole::Reviewer);
                    task.pending_note = None;
                }
                Consumption::Exhausted(ceiling) => self.force(task, Counter::Review, ceiling, &mut res),
            }
            res
        } else {
            task.ci_status = CiStatus::Failure;
            let mut res = Resolution::applied("ci failed");
            match self.counter.try_consume(task, Counter::Dev) {
                Consumption::Allowed(_) => {
                    Self::enter(task, Phase::CiFailed, "ci failed", &mut res);
                    task.pending_role = Some(AgentRole::CiFixer);
                    task.pending_note = Some(summary.to_string()).filter(|s| !s.is_empty());
                }
                Consumption::Exhausted(ceiling) => self.force(task, Counter::Dev, ceiling, &mut res),
            }
            res
        }
    }
}

fn review_body(verdict: &ReviewVerdict, iteration: u32, max_iterations: u32) -> String {
    let (title, name) = match verdict.verdict {
        Verdict::Approve => ("Approved", "approve"),
        Verdict::RequestChanges => ("Changes requested", "changes_requested"),
    };
    let mut body = format!("{REVIEW_MARKER}\n## Review: {title}\n\n");
    if !verdict.summary.is_empty() {
        body.push_str(&verdict.summary);
        body.push_str("\n\n");
    }
    for issue in &verdict.issues {
        body.push_str(&format!("- {issue}\n"));
    }
    let meta = json!({
        "verdict": name,
        "iteration": iteration,
        "max_iterations": max_iterations,
        "issues": verdict.issues,
    });
    body.push_str(&format!(
        "\n<details><summary>review metadata</summary>\n\n```json\n{meta}\n```\n</details>\n"
    ));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::budget::Ceilings;
    use crate::engine::tasks::TaskRef;
    use std::collections::BTreeSet;

    fn resolver(auto: bool) -> Resolver {
        Resolver::new(IterationCounter::new(Ceilings::default()), auto, true)
    }

    fn task(phase: Phase) -> Task {
        let mut t = Task::new(TaskRef::new("o/r", 42), "Add login", Utc::now());
        t.phase = phase;
        t
    }

    fn event(kind: EventKind) -> Event {
        Event {
            id: "e".into(),
            at: Utc::now(),
            task: TaskRef::new("o/r", 42),
            kind,
        }
    }

    fn run(role: AgentRole, outcome: AgentOutcome) -> AgentRun {
        AgentRun {
            role,
            started_at: Utc::now(),
            model_call_count: 1,
            outcome,
        }
    }

    fn change(sha: &str) -> ChangeSet {
        ChangeSet {
            branch: "sdlc/issue-42".into(),
            head_sha: sha.into(),
            summary: "did it".into(),
        }
    }

    fn verdict(v: Verdict) -> AgentOutcome {
        AgentOutcome::Success(Artifact::Verdict(ReviewVerdict {
            verdict: v,
            summary: "s".into(),
            issues: vec!["fix tests".into()],
        }))
    }

    fn ci(sha: &str, success: bool) -> Event {
        event(EventKind::CiCompleted {
            pr: 7,
            sha: sha.into(),
            success,
            summary: if success { String::new() } else { "- test (failure)".into() },
        })
    }

    #[test]
    fn new_issue_dispatches_planner() {
        let r = resolver(false);
        let mut t = task(Phase::New);
        let res = r.on_event(
            &mut t,
            &event(EventKind::IssueCreated {
                title: "Add login".into(),
                labels: BTreeSet::from(["feature".to_string()]),
            }),
            Utc::now(),
        );
        assert_eq!(res.disposition, Disposition::Applied);
        assert_eq!(t.phase, Phase::Planning);
        assert_eq!(res.dispatch, Some(AgentRole::Planner));
        assert_eq!(t.plan_iterations, 1);
        assert!(t.labels.contains("feature"));
        assert_eq!(res.transitions, vec![(Phase::New, Phase::Planning, "issue opened".to_string())]);
    }

    #[test]
    fn replan_does_not_touch_dev_or_review() {
        let r = resolver(false);
        let mut t = task(Phase::PlanReady);
        let res = r.on_event(&mut t, &event(EventKind::Command(Command::Plan(Some("smaller".into())))), Utc::now());
        assert_eq!(t.phase, Phase::Planning);
        assert_eq!(res.dispatch, Some(AgentRole::Planner));
        assert_eq!(t.pending_note.as_deref(), Some("smaller"));
        assert_eq!((t.dev_iterations, t.review_iterations), (0, 0));
    }

    #[test]
    fn plan_outcome_posts_plan_and_optionally_codes() {
        let mut t = task(Phase::Planning);
        let res = resolver(false).on_outcome(
            &mut t,
            &run(AgentRole::Planner, AgentOutcome::Success(Artifact::Plan("1. x".into()))),
            Utc::now(),
        );
        assert_eq!(t.phase, Phase::PlanReady);
        assert!(res.dispatch.is_none());
        assert!(matches!(&res.effects[0], Effect::Comment { body, .. } if body.starts_with(PLAN_MARKER)));

        let mut t = task(Phase::Planning);
        let res = resolver(true).on_outcome(
            &mut t,
            &run(AgentRole::Planner, AgentOutcome::Success(Artifact::Plan("1. x".into()))),
            Utc::now(),
        );
        assert_eq!(t.phase, Phase::Coding);
        assert_eq!(res.dispatch, Some(AgentRole::Coder));
        assert_eq!(t.dev_iterations, 1);
        assert_eq!(res.transitions.len(), 2);
    }

    #[test]
    fn code_command_only_where_coding_can_start() {
        let r = resolver(false);
        for phase in [Phase::New, Phase::Planning] {
            let mut t = task(phase);
            let res = r.on_event(&mut t, &event(EventKind::Command(Command::Code(None))), Utc::now());
            assert_eq!(res.disposition, Disposition::Ignored);
            assert_eq!(t.phase, phase);
        }
        // Coding already succeeded: ignored unless the PR was superseded
        let mut t = task(Phase::AwaitingCi);
        t.pr_number = Some(7);
        let res = r.on_event(&mut t, &event(EventKind::Command(Command::Code(None))), Utc::now());
        assert_eq!(res.disposition, Disposition::Ignored);
        t.superseded = true;
        let res = r.on_event(&mut t, &event(EventKind::Command(Command::Code(None))), Utc::now());
        assert_eq!(res.dispatch, Some(AgentRole::Coder));
        assert!(!t.superseded);
    }

    #[test]
    fn change_outcome_opens_pr_and_awaits_ci() {
        let mut t = task(Phase::Coding);
        let res = resolver(false).on_outcome(&mut t, &run(AgentRole::Coder, AgentOutcome::Success(Artifact::Change(change("abc")))), Utc::now());
        assert_eq!(t.phase, Phase::AwaitingCi);
        assert_eq!(t.head_sha.as_deref(), Some("abc"));
        assert_eq!(t.ci_status, CiStatus::Pending);
        match &res.effects[0] {
            Effect::OpenOrUpdatePr(draft) => {
                assert_eq!(draft.title, "Add login (#42)");
                assert!(draft.body.starts_with("Closes #42"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ci_results_route_to_reviewer_or_fixer() {
        let r = resolver(false);
        let mut t = task(Phase::AwaitingCi);
        t.head_sha = Some("abc".into());
        let res = r.on_event(&mut t, &ci("abc", false), Utc::now());
        assert_eq!(t.phase, Phase::CiFailed);
        assert_eq!(res.dispatch, Some(AgentRole::CiFixer));
        assert_eq!(t.pending_note.as_deref(), Some("- test (failure)"));
        assert_eq!(t.dev_iterations, 1);

        let mut t = task(Phase::AwaitingCi);
        t.head_sha = Some("abc".into());
        let res = r.on_event(&mut t, &ci("abc", true), Utc::now());
        assert_eq!(t.phase, Phase::ReviewPending);
        assert_eq!(res.dispatch, Some(AgentRole::Reviewer));
        assert_eq!(t.review_iterations, 1);
    }

    #[test]
    fn ci_for_an_older_sha_is_stale() {
        let mut t = task(Phase::AwaitingCi);
        t.head_sha = Some("new".into());
        let before = t.clone();
        let res = resolver(false).on_event(&mut t, &ci("old", false), Utc::now());
        assert_eq!(res.disposition, Disposition::Stale);
        assert_eq!(t, before);
    }

    #[test]
    fn dev_exhaustion_forces_approval_with_warning() {
        let mut t = task(Phase::AwaitingCi);
        t.head_sha = Some("abc".into());
        t.pr_number = Some(7);
        t.dev_iterations = 5;
        let res = resolver(false).on_event(&mut t, &ci("abc", false), Utc::now());
        assert_eq!(t.phase, Phase::ForcedApproved);
        assert!(res.dispatch.is_none());
        assert_eq!(t.dev_iterations, 5);
        assert!(matches!(&res.effects[0], Effect::Comment { body, .. } if body.contains("dev iteration budget is exhausted (5/5)")));
        assert!(matches!(&res.effects[1], Effect::Review { verdict: Verdict::Approve, .. }));
    }

    #[test]
    fn changes_requested_loops_back_to_coder() {
        let mut t = task(Phase::ReviewPending);
        t.pr_number = Some(7);
        t.review_iterations = 1;
        let res = resolver(false).on_outcome(&mut t, &run(AgentRole::Reviewer, verdict(Verdict::RequestChanges)), Utc::now());
        assert_eq!(t.phase, Phase::Coding);
        assert_eq!(t.feedback, vec!["fix tests"]);
        assert_eq!(res.dispatch, Some(AgentRole::Coder));
        match &res.effects[0] {
            Effect::Review { verdict: Verdict::RequestChanges, body } => {
                assert!(body.starts_with(REVIEW_MARKER));
                assert!(body.contains("\"iteration\":1"));
                assert!(body.contains("\"max_iterations\":5"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn last_review_round_forces_approval() {
        let mut t = task(Phase::ReviewPending);
        t.pr_number = Some(7);
        t.review_iterations = 5;
        let res = resolver(false).on_outcome(&mut t, &run(AgentRole::Reviewer, verdict(Verdict::RequestChanges)), Utc::now());
        assert_eq!(t.phase, Phase::ForcedApproved);
        assert!(res.reason.contains("review budget exhausted"));
        assert_eq!(t.review_iterations, 5);
    }

    #[test]
    fn approve_is_terminal() {
        let mut t = task(Phase::ReviewPending);
        t.pr_number = Some(7);
        let res = resolver(false).on_outcome(&mut t, &run(AgentRole::Reviewer, verdict(Verdict::Approve)), Utc::now());
        assert_eq!(t.phase, Phase::Approved);
        assert!(matches!(&res.effects[0], Effect::Review { verdict: Verdict::Approve, .. }));
        let res = resolver(false).on_event(&mut t, &event(EventKind::Command(Command::Code(None))), Utc::now());
        assert_eq!(res.disposition, Disposition::Ignored);
    }

    #[test]
    fn failures_keep_phase_and_cancellation_refunds() {
        let r = resolver(false);
        let mut t = task(Phase::Coding);
        t.dev_iterations = 2;
        t.pending_role = Some(AgentRole::Coder);
        let res = r.on_outcome(&mut t, &run(AgentRole::Coder, AgentOutcome::BudgetExceeded), Utc::now());
        assert_eq!(t.phase, Phase::Coding);
        assert!(t.pending_role.is_none());
        assert!(matches!(&res.effects[0], Effect::Comment { body, .. } if body.contains("agent-call-budget-exceeded")));

        let res = r.on_outcome(&mut t, &run(AgentRole::Coder, AgentOutcome::Cancelled), Utc::now());
        assert!(res.effects.is_empty());
        assert_eq!(t.dev_iterations, 1);
    }

    #[test]
    fn new_pr_supersedes_and_resets_dev() {
        let r = resolver(false);
        let mut t = task(Phase::ReviewPending);
        t.pr_number = Some(7);
        t.head_sha = Some("abc".into());
        t.dev_iterations = 3;
        let res = r.on_event(
            &mut t,
            &event(EventKind::PrUpdated { pr: 9, sha: "def".into(), branch: "human/fix".into() }),
            Utc::now(),
        );
        assert_eq!(res.disposition, Disposition::Applied);
        assert!(t.superseded);
        assert_eq!(t.dev_iterations, 0);
        assert_eq!(t.pr_number, Some(9));
        assert_eq!(t.phase, Phase::AwaitingCi);

        let res = r.on_event(
            &mut t,
            &event(EventKind::PrUpdated { pr: 9, sha: "def".into(), branch: "human/fix".into() }),
            Utc::now(),
        );
        assert_eq!(res.disposition, Disposition::Ignored);

        let keep = Resolver::new(IterationCounter::new(Ceilings::default()), false, false);
        let mut t = task(Phase::AwaitingCi);
        t.pr_number = Some(7);
        t.dev_iterations = 3;
        keep.on_event(&mut t, &event(EventKind::PrUpdated { pr: 8, sha: "x".into(), branch: "b".into() }), Utc::now());
        assert_eq!(t.dev_iterations, 3);
    }

    #[test]
    fn adversarial_ci_and_review_always_terminate_within_budget() {
        // Every pattern of CI results with every review requesting changes
        for pattern in [0b0000u8, 0b1111, 0b0101, 0b0011, 0b1000] {
            let r = resolver(false);
            let mut t = task(Phase::PlanReady);
            let mut res = r.on_event(&mut t, &event(EventKind::Command(Command::Code(None))), Utc::now());
            let mut dispatches = 0;
            let mut round = 0u32;
            while let Some(role) = res.dispatch {
                dispatches += 1;
                assert!(dispatches <= 20, "pattern {pattern:04b} did not terminate");
                let outcome = match role {
                    AgentRole::Coder => AgentOutcome::Success(Artifact::Change(change(&format!("s{dispatches}")))),
                    AgentRole::CiFixer => AgentOutcome::Success(Artifact::Fix {
                        change: change(&format!("s{dispatches}")),
                        diagnosis: "flaky".into(),
                    }),
                    AgentRole::Reviewer => verdict(Verdict::RequestChanges),
                    AgentRole::Planner => unreachable!("planner is never re-dispatched here"),
                };
                res = r.on_outcome(&mut t, &run(role, outcome), Utc::now());
                if res.dispatch.is_none() && t.phase == Phase::AwaitingCi {
                    t.pr_number = Some(7);
                    let sha = t.head_sha.clone().unwrap();
                    let passed = pattern & (1 << (round % 4)) == 0;
                    round += 1;
                    res = r.on_event(&mut t, &ci(&sha, passed), Utc::now());
                }
            }
            assert_eq!(t.phase, Phase::ForcedApproved, "pattern {pattern:04b}");
            assert!(t.dev_iterations <= 5 && t.review_iterations <= 5);
        }
    }
}
