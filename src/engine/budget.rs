//! Iteration budgets.
//!
//! Dev and review counters live on the Task and are consumed inside the
//! same transaction that commits the triggering decision. The agent-call
//! budget is per run and lives only in the dispatcher.

use serde::{Deserialize, Serialize};

use super::tasks::Task;

/// Ceilings for the bounded counters. Plan iterations are uncapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ceilings {
    pub dev: u32,
    pub review: u32,
    pub agent_calls: u32,
}

impl Default for Ceilings {
    fn default() -> Self {
        Self {
            dev: 5,
            review: 5,
            agent_calls: 50,
        }
    }
}

/// Per-task counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Plan,
    Dev,
    Review,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Dev => "dev",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// Counter incremented; carries the new value.
    Allowed(u32),
    /// Ceiling reached; nothing changed. Carries the ceiling.
    Exhausted(u32),
}

/// Read-before-increment access to a task's counters.
#[derive(Debug, Clone, Copy)]
pub struct IterationCounter {
    ceilings: Ceilings,
}

impl IterationCounter {
    pub fn new(ceilings: Ceilings) -> Self {
        Self { ceilings }
    }

    pub fn ceiling(&self, counter: Counter) -> Option<u32> {
        match counter {
            Counter::Plan => None,
            Counter::Dev => Some(self.ceilings.dev),
            Counter::Review => Some(self.ceilings.review),
        }
    }

    pub fn value(task: &Task, counter: Counter) -> u32 {
        match counter {
            Counter::Plan => task.plan_iterations,
            Counter::Dev => task.dev_iterations,
            Counter::Review => task.review_iterations,
        }
    }

    fn slot(task: &mut Task, counter: Counter) -> &mut u32 {
        match counter {
            Counter::Plan => &mut task.plan_iterations,
            Counter::Dev => &mut task.dev_iterations,
            Counter::Review => &mut task.review_iterations,
        }
    }

    pub fn try_consume(&self, task: &mut Task, counter: Counter) -> Consumption {
        let ceiling = self.ceiling(counter);
        let slot = Self::slot(task, counter);
        match ceiling {
            Some(max) if *slot >= max => Consumption::Exhausted(max),
            _ => {
                *slot += 1;
                Consumption::Allowed(*slot)
            }
        }
    }

    /// Give back one unit, for runs cancelled before they finished.
    pub fn refund(&self, task: &mut Task, counter: Counter) {
        let slot = Self::slot(task, counter);
        *slot = slot.saturating_sub(1);
    }

    /// Whether the next consumption would be refused.
    pub fn is_exhausted(&self, task: &Task, counter: Counter) -> bool {
        self.ceiling(counter)
            .is_some_and(|max| Self::value(task, counter) >= max)
    }
}

/// Model-call budget of a single agent run.
#[derive(Debug)]
pub struct CallBudget {
    ceiling: u32,
    used: u32,
}

impl CallBudget {
    pub fn new(ceiling: u32) -> Self {
        Self { ceiling, used: 0 }
    }

    pub fn try_consume(&mut self) -> Consumption {
        if self.used >= self.ceiling {
            return Consumption::Exhausted(self.ceiling);
        }
        self.used += 1;
        Consumption::Allowed(self.used)
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tasks::TaskRef;
    use chrono::Utc;

    fn task() -> Task {
        Task::new(TaskRef::new("o/r", 1), "t", Utc::now())
    }

    #[test]
    fn dev_counter_stops_at_ceiling_without_mutating() {
        let counter = IterationCounter::new(Ceilings::default());
        let mut t = task();
        for expected in 1..=5 {
            assert_eq!(counter.try_consume(&mut t, Counter::Dev), Consumption::Allowed(expected));
        }
        assert!(counter.is_exhausted(&t, Counter::Dev));
        assert_eq!(counter.try_consume(&mut t, Counter::Dev), Consumption::Exhausted(5));
        assert_eq!(t.dev_iterations, 5);
    }

    #[test]
    fn counters_are_independent() {
        let counter = IterationCounter::new(Ceilings { dev: 1, review: 2, agent_calls: 3 });
        let mut t = task();
        counter.try_consume(&mut t, Counter::Dev);
        assert_eq!(counter.try_consume(&mut t, Counter::Review), Consumption::Allowed(1));
        assert_eq!(counter.try_consume(&mut t, Counter::Dev), Consumption::Exhausted(1));
    }

    #[test]
    fn plan_counter_is_uncapped() {
        let counter = IterationCounter::new(Ceilings::default());
        let mut t = task();
        for _ in 0..20 {
            counter.try_consume(&mut t, Counter::Plan);
        }
        assert_eq!(t.plan_iterations, 20);
        assert!(!counter.is_exhausted(&t, Counter::Plan));
    }

    #[test]
    fn refund_never_goes_negative() {
        let counter = IterationCounter::new(Ceilings::default());
        let mut t = task();
        counter.try_consume(&mut t, Counter::Review);
        counter.refund(&mut t, Counter::Review);
        counter.refund(&mut t, Counter::Review);
        assert_eq!(t.review_iterations, 0);
    }

    #[test]
    fn call_budget_caps_calls() {
        let mut b = CallBudget::new(2);
        assert_eq!(b.try_consume(), Consumption::Allowed(1));
        assert_eq!(b.try_consume(), Consumption::Allowed(2));
        assert_eq!(b.try_consume(), Consumption::Exhausted(2));
        assert_eq!(b.used(), 2);
    }
}
