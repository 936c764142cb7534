//! Workflow Validation
//!
//! Provides validation for parsed workflows including:
//! - Job and step field validation
//! - Duplicate id detection
//! - Event trigger sanity checks
//! - Reference integrity and cycle detection (via the dependency graph)

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::error::{WorkflowError, WorkflowResult};

use super::graph::DependencyGraph;
use super::model::{Job, Workflow};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyWorkflowId,
    EmptyWorkflow,
    EmptyJobId(String),
    DuplicateJobId(String),
    NoSteps(String),
    EmptyCommand { job: String, step: String },
    NoWatchPaths { event: usize },
    UnknownEventJob { event: usize, job: String },
    InvalidSizeRange { event: usize, min: u64, max: u64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflowId => write!(f, "Workflow has an empty id"),
            Self::EmptyWorkflow => write!(f, "Workflow has no jobs"),
            Self::EmptyJobId(key) => write!(f, "Job '{}' has an empty id", key),
            Self::DuplicateJobId(id) => write!(f, "Duplicate job id: '{}'", id),
            Self::NoSteps(job) => write!(f, "Job '{}' has no steps", job),
            Self::EmptyCommand { job, step } => {
                write!(f, "Step '{}' of job '{}' has no command", step, job)
            }
            Self::NoWatchPaths { event } => write!(f, "Event #{} watches no paths", event),
            Self::UnknownEventJob { event, job } => {
                write!(f, "Event #{} targets unknown job '{}'", event, job)
            }
            Self::InvalidSizeRange { event, min, max } => write!(
                f,
                "Event #{} has min_size {} greater than max_size {}",
                event, min, max
            ),
        }
    }
}

/// Validates a single job's fields.
fn validate_job(job: &Job) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if job.id.trim().is_empty() {
        errors.push(ValidationError::EmptyJobId(job.key.clone()));
        return errors;
    }

    if job.steps.is_empty() {
        errors.push(ValidationError::NoSteps(job.id.clone()));
    }

    for step in &job.steps {
        if step.run.trim().is_empty() {
            errors.push(ValidationError::EmptyCommand {
                job: job.id.clone(),
                step: step.name.clone(),
            });
        }
        if step.local && step.image.is_some() {
            warn!(
                "Step '{}' of job '{}' is forced local; its image is ignored",
                step.name, job.id
            );
        }
    }

    if job.dependencies().is_empty() {
        debug!("Job '{}' is a root job (no dependencies)", job.id);
    }

    errors
}

fn validate_events(workflow: &Workflow, job_ids: &HashSet<&str>) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (index, event) in workflow.events.iter().enumerate() {
        if event.filter.paths.is_empty() {
            errors.push(ValidationError::NoWatchPaths { event: index });
        }

        if let (Some(min), Some(max)) = (event.filter.min_size, event.filter.max_size) {
            if min > max {
                errors.push(ValidationError::InvalidSizeRange {
                    event: index,
                    min,
                    max,
                });
            }
        }

        // Jobs of other workflows are checked when the trigger fires.
        if event.workflow_id == workflow.id {
            for job in &event.job_ids {
                if !job_ids.contains(job.as_str()) {
                    errors.push(ValidationError::UnknownEventJob {
                        event: index,
                        job: job.clone(),
                    });
                }
            }
        }
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. Workflow id is set and the workflow has jobs
/// 2. No duplicate job ids
/// 3. All jobs have steps with commands
/// 4. Event triggers are well formed
/// 5. All references point to existing jobs and there are no cycles
pub fn validate_workflow(workflow: &Workflow) -> WorkflowResult<()> {
    info!(
        "Validating workflow '{}' with {} jobs",
        workflow.id,
        workflow.jobs.len()
    );

    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    }
    if workflow.jobs.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for job in &workflow.jobs {
        if !seen_ids.insert(job.id.as_str()) {
            errors.push(ValidationError::DuplicateJobId(job.id.clone()));
        }
        errors.extend(validate_job(job));
    }

    errors.extend(validate_events(workflow, &seen_ids));

    if !errors.is_empty() {
        return Err(WorkflowError::Validation(
            errors.iter().map(|e| e.to_string()).collect(),
        ));
    }

    let graph = DependencyGraph::build(workflow)?;
    let layers = graph.order();

    info!(
        "Workflow '{}' validated: {} jobs in {} layers",
        workflow.id,
        workflow.jobs.len(),
        layers.len()
    );
    Ok(())
}
