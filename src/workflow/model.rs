//! Workflow Data Model
//!
//! Core data structures representing workflows, jobs and steps. A parsed
//! [`Workflow`] is immutable: the parser resolves defaults, normalizes job
//! references to ids and parses conditions before handing it out.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: CI
//! env:
//!   RUST_LOG: info
//! jobs:
//!   build:
//!     steps:
//!       - name: Compile
//!         run: cargo build
//!   test:
//!     needs: [build]
//!     steps:
//!       - run: cargo test
//!   notify:
//!     needs: [test]
//!     if: not test
//!     steps:
//!       - run: echo "tests failed"
//!         local: true
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::ConditionSyntaxError;
use crate::events::EventTrigger;
use crate::output::OutputConfig;

use super::condition::Condition;

/// A single command within a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Display name (`step <n>` when not given)
    pub name: String,

    /// Command text handed to the shell
    pub run: String,

    /// Working directory, relative to the run directory unless absolute
    pub working_dir: Option<PathBuf>,

    /// Step-level environment, highest precedence
    pub env: BTreeMap<String, String>,

    /// Forces the local runner even when containers are enabled
    pub local: bool,

    /// Container image override for this step
    pub image: Option<String>,

    /// Guard evaluated before the step runs; false skips the step
    pub condition: Option<Condition>,

    /// Lets the job continue when this step fails
    pub continue_on_error: bool,

    /// Shell override for the local runner
    pub shell: Option<String>,
}

impl Step {
    /// Creates a new step with the given name and command.
    ///
    /// # Example
    ///
    /// ```
    /// use localflow::workflow::Step;
    ///
    /// let step = Step::new("greet", "echo $GREETING")
    ///     .with_env("GREETING", "hello")
    ///     .local();
    /// assert!(step.local);
    /// ```
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            run: run.into(),
            working_dir: None,
            env: BTreeMap::new(),
            local: false,
            image: None,
            condition: None,
            continue_on_error: false,
            shell: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Sets the step guard.
    pub fn with_condition(mut self, expression: &str) -> Result<Self, ConditionSyntaxError> {
        self.condition = Some(Condition::parse(expression)?);
        Ok(self)
    }

    /// Forces the local runner.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// A named unit of work: ordered steps plus dependencies and a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Key under `jobs:` in the source document
    pub key: String,

    /// Unique id within the workflow
    pub id: String,

    pub description: Option<String>,

    pub tags: BTreeSet<String>,

    /// Job-level environment
    pub env: BTreeMap<String, String>,

    /// Container image for every step of this job
    pub image: Option<String>,

    /// Steps, executed in order
    pub steps: Vec<Step>,

    /// Ids of jobs that must finish first, in declaration order
    pub needs: Vec<String>,

    /// Guard deciding whether the job runs once its dependencies finished
    pub condition: Option<Condition>,
}

impl Job {
    /// Creates a job whose key and id are the same.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            key: id.clone(),
            id,
            description: None,
            tags: BTreeSet::new(),
            env: BTreeMap::new(),
            image: None,
            steps: Vec::new(),
            needs: Vec::new(),
            condition: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Adds a dependency on another job.
    pub fn depends_on(mut self, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        if !self.needs.contains(&job_id) {
            self.needs.push(job_id);
        }
        self
    }

    /// Sets the job condition.
    pub fn with_condition(mut self, expression: &str) -> Result<Self, ConditionSyntaxError> {
        self.condition = Some(Condition::parse(expression)?);
        Ok(self)
    }

    /// All jobs this job must wait for: `needs`, condition references,
    /// condition `needs` and step guard references.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();

        for need in &self.needs {
            push_unique(&mut deps, need);
        }
        if let Some(condition) = &self.condition {
            for id in condition.dependencies() {
                push_unique(&mut deps, id);
            }
        }
        for step in &self.steps {
            if let Some(condition) = &step.condition {
                for id in condition.dependencies() {
                    push_unique(&mut deps, id);
                }
            }
        }
        deps
    }

    /// Jobs whose outcome is decided by the job condition rather than by the
    /// implicit "dependency succeeded" rule.
    pub fn condition_references(&self) -> Vec<&str> {
        self.condition
            .as_ref()
            .map(|c| c.references())
            .unwrap_or_default()
    }

    /// Dependencies that must succeed for the job to run: `needs` and the
    /// condition's `needs`, minus the jobs the condition itself tests.
    pub fn required_dependencies(&self) -> Vec<&str> {
        let tested = self.condition_references();
        let mut deps: Vec<&str> = Vec::new();

        let condition_needs = self
            .condition
            .iter()
            .flat_map(|c| c.needs().iter());
        for need in self.needs.iter().chain(condition_needs) {
            if !tested.contains(&need.as_str()) {
                push_unique(&mut deps, need);
            }
        }
        deps
    }
}

fn push_unique<'a>(deps: &mut Vec<&'a str>, id: &'a str) {
    if !deps.contains(&id) {
        deps.push(id);
    }
}

/// A complete workflow: metadata, shared environment, jobs and triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub id: String,

    pub name: String,

    pub description: Option<String>,

    pub version: String,

    pub author: Option<String>,

    pub tags: BTreeSet<String>,

    /// Workflow-level environment, lowest declared precedence
    pub env: BTreeMap<String, String>,

    /// Default container image for all jobs
    pub image: Option<String>,

    /// Jobs in declaration order
    pub jobs: Vec<Job>,

    /// File-system triggers declared by this workflow
    pub events: Vec<EventTrigger>,

    /// Output routing overriding the global configuration
    pub output: Option<OutputConfig>,

    /// File the workflow was loaded from
    pub source: Option<PathBuf>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: "1.0.0".to_string(),
            author: None,
            tags: BTreeSet::new(),
            env: BTreeMap::new(),
            image: None,
            jobs: Vec::new(),
            events: Vec::new(),
            output: None,
            source: None,
        }
    }

    /// Creates a workflow from a list of jobs.
    pub fn from_jobs(id: impl Into<String>, jobs: Vec<Job>) -> Self {
        let id = id.into();
        let mut workflow = Self::new(id.clone(), id);
        workflow.jobs = jobs;
        workflow
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Gets a job by id, falling back to its source key.
    pub fn get_job(&self, id_or_key: &str) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|j| j.id == id_or_key)
            .or_else(|| self.jobs.iter().find(|j| j.key == id_or_key))
    }

    /// Position of a job in declaration order.
    pub fn job_index(&self, id: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    pub fn job_ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    /// Directory of the source file, if the workflow came from disk.
    pub fn source_dir(&self) -> Option<&Path> {
        self.source.as_deref().and_then(Path::parent)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns the number of jobs in the workflow.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the workflow has no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
