//! Run Report
//!
//! The outcome of one engine invocation: per-job outcome, the reason a job
//! was skipped or failed, per-step results and timings. Also renders the
//! ASCII timeline printed after a run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::runner::RunnerKind;
use super::state::JobOutcome;

/// Why a job did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// The job condition evaluated to false
    ConditionFalse { condition: String },
    /// A dependency the job only needed to succeed did not succeed
    DependencyNotSatisfied { job: String, outcome: JobOutcome },
    Cancelled,
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConditionFalse { condition } => write!(f, "condition '{}' is false", condition),
            Self::DependencyNotSatisfied { job, outcome } => {
                write!(f, "dependency '{}' {}", job, outcome)
            }
            Self::Cancelled => f.write_str("run cancelled"),
            Self::DryRun => f.write_str("dry run"),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum FailureCause {
    /// A step exited nonzero
    StepFailed { step: String, exit_code: i32 },
    /// The runner could not execute a step
    Infrastructure { step: String, message: String },
    /// A step was aborted by cancellation
    Cancelled { step: String },
    /// The job condition could not be evaluated
    Condition { message: String },
}

impl FailureCause {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure { .. })
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepFailed { step, exit_code } => {
                write!(f, "step '{}' exited with {}", step, exit_code)
            }
            Self::Infrastructure { step, message } => {
                write!(f, "step '{}' could not run: {}", step, message)
            }
            Self::Cancelled { step } => write!(f, "step '{}' cancelled", step),
            Self::Condition { message } => write!(f, "condition error: {}", message),
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub runner: RunnerKind,
    /// `None` when the step was skipped or never produced an exit code
    pub exit_code: Option<i32>,
    pub skipped: bool,
    /// Failed but marked `continue_on_error`
    pub tolerated: bool,
    pub duration_ms: u64,
}

/// Result of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub id: String,
    pub key: String,
    pub outcome: JobOutcome,
    pub skip_reason: Option<SkipReason>,
    pub failure: Option<FailureCause>,
    pub steps: Vec<StepReport>,
    /// Milliseconds after the run started
    pub started_offset_ms: Option<u64>,
    pub duration_ms: u64,
}

impl JobReport {
    pub fn skipped(id: impl Into<String>, key: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            outcome: JobOutcome::Skipped,
            skip_reason: Some(reason),
            failure: None,
            steps: Vec::new(),
            started_offset_ms: None,
            duration_ms: 0,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workflow_id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Job reports in execution order
    pub jobs: Vec<JobReport>,
    /// Resolved layers of job ids
    pub execution_order: Vec<Vec<String>>,
    pub dry_run: bool,
}

impl RunReport {
    /// True when no job failed.
    pub fn is_success(&self) -> bool {
        self.jobs.iter().all(|j| j.outcome != JobOutcome::Failed)
    }

    pub fn job(&self, id_or_key: &str) -> Option<&JobReport> {
        self.jobs
            .iter()
            .find(|j| j.id == id_or_key || j.key == id_or_key)
    }

    pub fn failed_jobs(&self) -> Vec<&str> {
        self.jobs_with(JobOutcome::Failed)
    }

    pub fn skipped_jobs(&self) -> Vec<&str> {
        self.jobs_with(JobOutcome::Skipped)
    }

    pub fn succeeded_jobs(&self) -> Vec<&str> {
        self.jobs_with(JobOutcome::Success)
    }

    fn jobs_with(&self, outcome: JobOutcome) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|j| j.outcome == outcome)
            .map(|j| j.id.as_str())
            .collect()
    }

    /// Job ids in the order they were executed, flattened.
    pub fn ordered_ids(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn has_infrastructure_failure(&self) -> bool {
        self.jobs
            .iter()
            .filter_map(|j| j.failure.as_ref())
            .any(FailureCause::is_infrastructure)
    }

    /// Process exit code for this run: 0, 4 (job failure) or 5 (infrastructure).
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else if self.has_infrastructure_failure() {
            5
        } else {
            4
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    /// ASCII timeline of the jobs that ran.
    ///
    /// Each job is shown as a bar indicating when it ran relative to the
    /// total run time.
    pub fn timeline(&self) -> String {
        let mut output = String::from("Timeline:\n");
        let total = self.duration_ms().max(1);

        // Scale to 50 characters width
        let scale = 50.0 / total as f64;

        for job in &self.jobs {
            let start = match job.started_offset_ms {
                Some(start) => start,
                None => continue,
            };
            let start_pos = (start as f64 * scale) as usize;
            let width = ((job.duration_ms as f64 * scale).max(1.0)) as usize;

            let mut bar = " ".repeat(start_pos.min(50));
            bar.push_str(&"#".repeat(width.min(50)));
            output.push_str(&format!(
                "{} |{:<50}| ({} ms)\n",
                truncate(&job.key, 16),
                bar,
                job.duration_ms
            ));
        }

        output.push_str(&format!("Total: {} ms\n", total));
        output
    }
}

/// Pads or truncates a string to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
