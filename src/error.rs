//! Error Types
//!
//! Failure taxonomy for loading, resolving and evaluating workflows.
//! Runner, event and daemon failures live next to their subsystems
//! ([`crate::execution::RunnerError`], [`crate::events::EventError`],
//! [`crate::daemon::DaemonError`]).

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised before any step of a run executes.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The workflow source could not be read.
    #[error("Failed to read workflow file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The workflow source is not valid YAML or does not match the schema.
    #[error("Failed to parse workflow '{origin}': {message}")]
    Parse { origin: String, message: String },

    /// Structural problems found by the validator.
    #[error("Workflow validation failed:\n{}", bullet_list(.0))]
    Validation(Vec<String>),

    /// A `needs` entry or condition token names a job that does not exist.
    #[error("Job '{job}' references unknown job '{reference}'")]
    UnknownJob { job: String, reference: String },

    /// The dependency graph contains at least one cycle.
    #[error("Dependency cycle between jobs: {}", .members.join(", "))]
    Cycle { members: Vec<String> },

    #[error(transparent)]
    ConditionSyntax(#[from] ConditionSyntaxError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// A selective run targeted a job that is not in the workflow.
    #[error("Job '{0}' not found in workflow")]
    JobNotFound(String),

    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),
}

impl WorkflowError {
    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Read { .. }
            | Self::Parse { .. }
            | Self::Validation(_)
            | Self::ConditionSyntax(_)
            | Self::JobNotFound(_) => 2,
            Self::UnknownJob { .. } | Self::Cycle { .. } => 3,
            Self::Condition(_) | Self::WorkflowNotFound(_) => 1,
        }
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("  - {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A condition expression that does not match the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid condition '{expression}': {message} (at '{fragment}')")]
pub struct ConditionSyntaxError {
    /// The full expression text.
    pub expression: String,
    /// The offending part of the expression.
    pub fragment: String,
    pub message: String,
}

/// Failures while evaluating an already-parsed condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error(transparent)]
    Syntax(#[from] ConditionSyntaxError),

    /// The referenced job has not reached a terminal outcome yet.
    #[error("Condition references job '{job}' which is still {outcome}")]
    UnresolvedJob { job: String, outcome: String },

    /// The referenced job is not part of the current run.
    #[error("Condition references job '{0}' which is not part of this run")]
    UnknownJob(String),
}

/// Result type for workflow loading and resolution.
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;
