//! Run State
//!
//! Per-run bookkeeping of job outcomes. A `RunState` is owned by exactly one
//! engine invocation and is read by the condition evaluator.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::env::EnvStack;

/// Lifecycle outcome of a job within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    /// Waiting for its dependencies
    Pending,
    /// Steps are executing
    Running,
    /// All steps finished successfully
    Success,
    /// A step failed or the runner could not execute it
    Failed,
    /// Not executed (condition false, dependency not satisfied, cancelled)
    Skipped,
}

impl JobOutcome {
    /// Returns true once the job can no longer change outcome.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome map for the jobs taking part in one run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    outcomes: HashMap<String, JobOutcome>,
    env: EnvStack,
}

impl RunState {
    /// Creates a state with every given job pending.
    pub fn new<I, S>(job_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outcomes: job_ids
                .into_iter()
                .map(|id| (id.into(), JobOutcome::Pending))
                .collect(),
            env: EnvStack::new(),
        }
    }

    /// Sets the base environment layers shared by every job of the run.
    pub fn with_env(mut self, env: EnvStack) -> Self {
        self.env = env;
        self
    }

    pub fn env(&self) -> &EnvStack {
        &self.env
    }

    /// Outcome of a job, or `None` when the job is not part of the run.
    pub fn outcome(&self, job_id: &str) -> Option<JobOutcome> {
        self.outcomes.get(job_id).copied()
    }

    pub fn set(&mut self, job_id: impl Into<String>, outcome: JobOutcome) {
        self.outcomes.insert(job_id.into(), outcome);
    }

    /// Marks a pending job as running; returns false if it was not pending.
    pub fn start(&mut self, job_id: &str) -> bool {
        match self.outcomes.get_mut(job_id) {
            Some(outcome) if *outcome == JobOutcome::Pending => {
                *outcome = JobOutcome::Running;
                true
            }
            _ => false,
        }
    }

    pub fn is_success(&self, job_id: &str) -> bool {
        self.outcome(job_id) == Some(JobOutcome::Success)
    }

    /// All jobs currently holding the given outcome, sorted by id.
    pub fn jobs_with(&self, outcome: JobOutcome) -> BTreeSet<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == outcome)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.outcomes.values().all(|o| o.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_pending() {
        let state = RunState::new(["a", "b"]);
        assert_eq!(state.outcome("a"), Some(JobOutcome::Pending));
        assert_eq!(state.outcome("missing"), None);
        assert!(!state.all_terminal());
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_terminal_outcomes() {
        assert!(JobOutcome::Success.is_terminal());
        assert!(JobOutcome::Failed.is_terminal());
        assert!(JobOutcome::Skipped.is_terminal());
        assert!(!JobOutcome::Pending.is_terminal());
        assert!(!JobOutcome::Running.is_terminal());
    }

    #[test]
    fn test_jobs_with_outcome() {
        let mut state = RunState::new(["a", "b", "c"]);
        state.set("a", JobOutcome::Success);
        state.set("b", JobOutcome::Failed);
        state.set("c", JobOutcome::Failed);

        let failed: Vec<_> = state.jobs_with(JobOutcome::Failed).into_iter().collect();
        assert_eq!(failed, vec!["b", "c"]);
        assert!(state.is_success("a"));
        assert!(state.all_terminal());
    }

    #[test]
    fn test_start_moves_pending_to_running() {
        let mut state = RunState::new(["a"]);

        assert!(state.start("a"));
        assert_eq!(state.outcome("a"), Some(JobOutcome::Running));
        assert!(!state.start("a"));
        assert!(!state.start("missing"));

        state.set("a", JobOutcome::Success);
        assert!(state.all_terminal());
    }

    #[test]
    fn test_outcome_serializes_lowercase() {
        let json = serde_json::to_string(&JobOutcome::Skipped).unwrap();
        assert_eq!(json, "\"skipped\"");
        assert_eq!(JobOutcome::Running.to_string(), "running");
    }
}
