//! Workflow Execution Engine
//!
//! The core engine that orchestrates a workflow run:
//! - Dependency resolution into layers of independent jobs
//! - Parallel job execution within a layer, bounded by `max_parallel`
//! - Skip rules for unsatisfied dependencies and false conditions
//! - Sequential step execution through the local or container runner
//! - Cancellation and dry runs

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{WorkflowError, WorkflowResult};
use crate::output::OutputSink;
use crate::workflow::{validate_workflow, DependencyGraph, Job, Step, Workflow};

use super::container::{ContainerRunner, DEFAULT_IMAGE};
use super::env::EnvStack;
use super::local::{LocalRunner, DEFAULT_SHELL};
use super::report::{FailureCause, JobReport, RunReport, SkipReason, StepReport};
use super::runner::{Runner, RunnerKind, StepRequest};
use super::state::{JobOutcome, RunState};

/// Default number of jobs run at once within a layer.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// What happens to a job once its layer comes up.
enum Decision {
    Run,
    Skip(SkipReason),
    Fail(FailureCause),
}

/// Per-run values shared by the job threads of a layer.
struct RunContext<'a> {
    snapshot: &'a RunState,
    run_dir: &'a Path,
    clock: Instant,
}

/// Workflow execution engine.
///
/// Runs a whole workflow or the dependency closure of one job, and returns a
/// [`RunReport`] describing every job that took part.
///
/// # Example
///
/// ```rust,no_run
/// use localflow::execution::Engine;
/// use localflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("ci.yml")?;
///     let mut engine = Engine::new(workflow);
///     engine.set_max_parallel(2);
///     engine.set_working_dir("/src/project");
///
///     let report = engine.run()?;
///     println!("{}", report.timeline());
///     Ok(())
/// }
/// ```
pub struct Engine {
    workflow: Workflow,
    max_parallel: usize,
    docker_enabled: bool,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    shell: String,
    default_image: String,
    output: Arc<OutputSink>,
    cancel: CancellationToken,
    local: Arc<dyn Runner>,
    container: Arc<dyn Runner>,
}

impl Engine {
    /// Creates a new execution engine for a workflow.
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            max_parallel: DEFAULT_MAX_PARALLEL,
            docker_enabled: false,
            dry_run: false,
            working_dir: None,
            shell: DEFAULT_SHELL.display().to_string(),
            default_image: DEFAULT_IMAGE.to_string(),
            output: Arc::new(OutputSink::stdout()),
            cancel: CancellationToken::new(),
            local: Arc::new(LocalRunner::new()),
            container: Arc::new(ContainerRunner::default()),
        }
    }

    /// Creates an engine using the runner settings from `config`.
    pub fn from_config(workflow: Workflow, config: &Config) -> Self {
        let mut engine = Self::new(workflow);
        engine.set_max_parallel(config.max_parallel);
        engine.set_docker_enabled(config.docker_enabled);
        engine.set_default_image(config.docker_default_image.clone());
        if let Some(shell) = &config.default_shell {
            engine.set_shell(shell.clone());
        }
        if let Some(binary) = &config.docker_binary {
            engine.container = Arc::new(ContainerRunner::new(binary));
        }
        engine
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Sets the maximum number of parallel jobs; `0` means one per CPU.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = if max == 0 { num_cpus::get() } else { max };
    }

    /// Runs steps in containers unless they are marked `local`.
    pub fn set_docker_enabled(&mut self, enabled: bool) {
        self.docker_enabled = enabled;
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Sets the run directory that relative step directories resolve against.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    pub fn set_shell(&mut self, shell: impl Into<String>) {
        self.shell = shell.into();
    }

    pub fn set_default_image(&mut self, image: impl Into<String>) {
        self.default_image = image.into();
    }

    pub fn set_output(&mut self, output: Arc<OutputSink>) {
        self.output = output;
    }

    /// Uses `token` to abort the run; in-flight steps are killed.
    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Replaces the runners, e.g. with test doubles.
    pub fn set_runners(&mut self, local: Arc<dyn Runner>, container: Arc<dyn Runner>) {
        self.local = local;
        self.container = container;
    }

    /// Executes every job of the workflow.
    ///
    /// # Returns
    ///
    /// * `Ok(report)` - The run happened; check [`RunReport::is_success`]
    /// * `Err` - The workflow is invalid and nothing was executed
    pub fn run(&self) -> WorkflowResult<RunReport> {
        validate_workflow(&self.workflow)?;
        let graph = DependencyGraph::build(&self.workflow)?;
        self.execute(graph.order())
    }

    /// Executes `target` (id or key) and everything it transitively depends on.
    pub fn run_job(&self, target: &str) -> WorkflowResult<RunReport> {
        validate_workflow(&self.workflow)?;
        let graph = DependencyGraph::build(&self.workflow)?;
        let layers = graph.closure_for(target)?;
        self.execute(layers)
    }

    /// Executes the union of the closures of `targets`; all jobs when empty.
    pub fn run_jobs(&self, targets: &[String]) -> WorkflowResult<RunReport> {
        match targets {
            [] => self.run(),
            [target] => self.run_job(target),
            _ => {
                validate_workflow(&self.workflow)?;
                let graph = DependencyGraph::build(&self.workflow)?;
                let mut wanted = Vec::new();
                for target in targets {
                    wanted.extend(graph.closure_for(target)?.into_iter().flatten());
                }
                let layers = graph
                    .order()
                    .into_iter()
                    .map(|layer| {
                        layer
                            .into_iter()
                            .filter(|id| wanted.contains(id))
                            .collect::<Vec<_>>()
                    })
                    .filter(|layer| !layer.is_empty())
                    .collect();
                self.execute(layers)
            }
        }
    }

    /// Renders the resolved plan printed by dry runs.
    pub fn plan(&self, layers: &[Vec<String>]) -> String {
        let mut out = format!(
            "[DRY RUN] Workflow: {} ({})\n",
            self.workflow.name, self.workflow.id
        );
        for (index, layer) in layers.iter().enumerate() {
            out.push_str(&format!("Layer {}:\n", index + 1));
            for job in layer.iter().filter_map(|id| self.workflow.get_job(id)) {
                out.push_str(&format!("  Job: {} ({})\n", job.key, job.id));
                if !job.needs.is_empty() {
                    out.push_str(&format!("    needs: {}\n", job.needs.join(", ")));
                }
                if let Some(condition) = &job.condition {
                    out.push_str(&format!("    if: {}\n", condition));
                }
                for step in &job.steps {
                    let kind = RunnerKind::select(step, self.docker_enabled);
                    match kind {
                        RunnerKind::Local => {
                            out.push_str(&format!("    Step: {} [local]\n", step.name))
                        }
                        RunnerKind::Container => out.push_str(&format!(
                            "    Step: {} [container {}]\n",
                            step.name,
                            self.image_for(job, step)
                        )),
                    }
                    out.push_str(&format!("      run: {}\n", step.run));
                }
            }
        }
        out
    }

    fn execute(&self, layers: Vec<Vec<String>>) -> WorkflowResult<RunReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_dir = self.run_dir();

        let job_count: usize = layers.iter().map(Vec::len).sum();
        info!(
            "Running workflow '{}' ({} jobs in {} layers, max parallel: {}, docker: {}, dry run: {})",
            self.workflow.name,
            job_count,
            layers.len(),
            self.max_parallel,
            self.docker_enabled,
            self.dry_run
        );

        let mut base_env = EnvStack::new();
        base_env.push(self.workflow.env.clone());
        let mut state = RunState::new(layers.iter().flatten().cloned()).with_env(base_env);
        let mut reports: HashMap<String, JobReport> = HashMap::new();

        if self.dry_run {
            self.output.write(&self.plan(&layers));
        }

        for layer in &layers {
            let mut runnable = Vec::new();
            for id in layer {
                let job = self
                    .workflow
                    .get_job(id)
                    .ok_or_else(|| WorkflowError::JobNotFound(id.clone()))?;

                match self.decide(job, &state) {
                    Decision::Run => runnable.push(job),
                    Decision::Skip(reason) => {
                        info!("Skipping job '{}': {}", job.key, reason);
                        state.set(&job.id, JobOutcome::Skipped);
                        reports.insert(job.id.clone(), JobReport::skipped(&job.id, &job.key, reason));
                    }
                    Decision::Fail(cause) => {
                        error!("Job '{}' failed: {}", job.key, cause);
                        state.set(&job.id, JobOutcome::Failed);
                        reports.insert(job.id.clone(), failed_report(job, cause));
                    }
                }
            }

            // Step guards read the outcomes of earlier layers only.
            let snapshot = state.clone();
            let context = RunContext {
                snapshot: &snapshot,
                run_dir: &run_dir,
                clock,
            };
            for report in self.run_layer(&runnable, &context, &mut state) {
                reports.insert(report.id.clone(), report);
            }
        }

        let jobs = layers
            .iter()
            .flatten()
            .filter_map(|id| reports.remove(id))
            .collect();

        let report = RunReport {
            workflow_id: self.workflow.id.clone(),
            workflow_name: self.workflow.name.clone(),
            started_at,
            finished_at: Utc::now(),
            jobs,
            execution_order: layers,
            dry_run: self.dry_run,
        };

        info!(
            "Workflow '{}' finished in {} ms: {} succeeded, {} failed, {} skipped",
            self.workflow.name,
            report.duration_ms(),
            report.succeeded_jobs().len(),
            report.failed_jobs().len(),
            report.skipped_jobs().len()
        );

        Ok(report)
    }

    /// Applies the skip rules to a job whose dependencies are all terminal.
    fn decide(&self, job: &Job, state: &RunState) -> Decision {
        if self.cancel.is_cancelled() {
            return Decision::Skip(SkipReason::Cancelled);
        }

        for dep in job.required_dependencies() {
            let outcome = state.outcome(dep).unwrap_or(JobOutcome::Pending);
            if outcome != JobOutcome::Success {
                return Decision::Skip(SkipReason::DependencyNotSatisfied {
                    job: dep.to_string(),
                    outcome,
                });
            }
        }

        if let Some(condition) = &job.condition {
            match condition.evaluate(state) {
                Ok(true) => {}
                Ok(false) => {
                    return Decision::Skip(SkipReason::ConditionFalse {
                        condition: condition.source().to_string(),
                    })
                }
                Err(e) => {
                    return Decision::Fail(FailureCause::Condition {
                        message: e.to_string(),
                    })
                }
            }
        }

        if self.dry_run {
            return Decision::Skip(SkipReason::DryRun);
        }

        Decision::Run
    }

    /// Runs the jobs of one layer on scoped threads, at most `max_parallel`
    /// at a time, returning their reports in completion order.
    ///
    /// Each job is marked running in `state` when dispatched and receives its
    /// final outcome when its report arrives.
    fn run_layer(
        &self,
        jobs: &[&Job],
        context: &RunContext<'_>,
        state: &mut RunState,
    ) -> Vec<JobReport> {
        let mut finished = Vec::with_capacity(jobs.len());
        if jobs.is_empty() {
            return finished;
        }

        let (tx, rx) = channel::<JobReport>();
        let max_parallel = self.max_parallel.max(1);

        thread::scope(|scope| {
            let mut pending = jobs.iter();
            let mut running = 0;

            loop {
                while running < max_parallel {
                    let job = match pending.next() {
                        Some(job) => *job,
                        None => break,
                    };

                    if self.cancel.is_cancelled() {
                        info!("Skipping job '{}': run cancelled", job.key);
                        state.set(&job.id, JobOutcome::Skipped);
                        finished.push(JobReport::skipped(&job.id, &job.key, SkipReason::Cancelled));
                        continue;
                    }

                    if !state.start(&job.id) {
                        warn!("Job '{}' dispatched while not pending", job.key);
                    }
                    info!("Starting job: {}", job.key);
                    let tx = tx.clone();
                    scope.spawn(move || {
                        let report = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.execute_job(job, context)
                        }))
                        .unwrap_or_else(|_| {
                            failed_report(
                                job,
                                FailureCause::Infrastructure {
                                    step: String::new(),
                                    message: "job thread panicked".to_string(),
                                },
                            )
                        });

                        if let Err(e) = tx.send(report) {
                            error!("Failed to send completion signal: {}", e);
                        }
                    });
                    running += 1;
                }

                if running == 0 {
                    break;
                }

                match rx.recv() {
                    Ok(report) => {
                        running -= 1;
                        state.set(&report.id, report.outcome);
                        match report.outcome {
                            JobOutcome::Success => {
                                info!("Job '{}' completed successfully", report.key)
                            }
                            _ => {
                                if let Some(cause) = &report.failure {
                                    error!("Job '{}' failed: {}", report.key, cause);
                                }
                            }
                        }
                        finished.push(report);
                    }
                    Err(e) => {
                        error!("Failed to receive job completion: {}", e);
                        break;
                    }
                }
            }
        });

        finished
    }

    /// Runs the steps of one job in order.
    fn execute_job(&self, job: &Job, context: &RunContext<'_>) -> JobReport {
        let started = Instant::now();
        let offset = context.clock.elapsed().as_millis() as u64;
        let job_env = context.snapshot.env().with_layer(&job.env);

        let mut steps = Vec::with_capacity(job.steps.len());
        let mut failure = None;

        for step in &job.steps {
            let kind = RunnerKind::select(step, self.docker_enabled);

            if let Some(condition) = &step.condition {
                match condition.evaluate(context.snapshot) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("[{}] Skipping step '{}': condition '{}' is false", job.key, step.name, condition);
                        steps.push(StepReport {
                            name: step.name.clone(),
                            runner: kind,
                            exit_code: None,
                            skipped: true,
                            tolerated: false,
                            duration_ms: 0,
                        });
                        continue;
                    }
                    Err(e) => {
                        failure = Some(FailureCause::Condition {
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }

            if self.cancel.is_cancelled() {
                failure = Some(FailureCause::Cancelled {
                    step: step.name.clone(),
                });
                break;
            }

            let env = job_env.with_layer(&step.env).resolve();
            let workdir = step_workdir(step, context.run_dir);
            let image = self.image_for(job, step);
            let shell = step.shell.as_deref().unwrap_or(&self.shell);
            let request = StepRequest {
                job_id: &job.id,
                step_name: &step.name,
                command: &step.run,
                shell,
                env: &env,
                workdir: &workdir,
                image,
            };

            let runner = match kind {
                RunnerKind::Local => &self.local,
                RunnerKind::Container => &self.container,
            };
            let used = runner.kind();
            info!("[{}] Running step '{}' ({})", job.key, step.name, used.as_str());

            match runner.execute(&request, &self.cancel) {
                Ok(outcome) => {
                    self.output
                        .write_step(&job.key, &step.name, &outcome.stdout, &outcome.stderr);

                    let failed = !outcome.success();
                    let tolerated = failed && !outcome.cancelled && step.continue_on_error;
                    steps.push(StepReport {
                        name: step.name.clone(),
                        runner: used,
                        exit_code: Some(outcome.exit_code),
                        skipped: false,
                        tolerated,
                        duration_ms: outcome.duration_ms,
                    });

                    if outcome.cancelled {
                        warn!("[{}] Step '{}' cancelled", job.key, step.name);
                        failure = Some(FailureCause::Cancelled {
                            step: step.name.clone(),
                        });
                        break;
                    }
                    if tolerated {
                        warn!(
                            "[{}] Step '{}' exited with {} (continuing)",
                            job.key, step.name, outcome.exit_code
                        );
                    } else if failed {
                        failure = Some(FailureCause::StepFailed {
                            step: step.name.clone(),
                            exit_code: outcome.exit_code,
                        });
                        break;
                    } else {
                        debug!("[{}] Step '{}' succeeded", job.key, step.name);
                    }
                }
                Err(e) => {
                    error!("[{}] Step '{}' could not run: {}", job.key, step.name, e);
                    steps.push(StepReport {
                        name: step.name.clone(),
                        runner: used,
                        exit_code: None,
                        skipped: false,
                        tolerated: false,
                        duration_ms: 0,
                    });
                    failure = Some(FailureCause::Infrastructure {
                        step: step.name.clone(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        JobReport {
            id: job.id.clone(),
            key: job.key.clone(),
            outcome: if failure.is_some() {
                JobOutcome::Failed
            } else {
                JobOutcome::Success
            },
            skip_reason: None,
            failure,
            steps,
            started_offset_ms: Some(offset),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Image precedence: step, job, workflow, configured default.
    fn image_for<'a>(&'a self, job: &'a Job, step: &'a Step) -> &'a str {
        step.image
            .as_deref()
            .or(job.image.as_deref())
            .or(self.workflow.image.as_deref())
            .unwrap_or(&self.default_image)
    }

    fn run_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|e| {
                warn!("Cannot read current directory ({}), using '.'", e);
                PathBuf::from(".")
            }),
        }
    }
}

fn step_workdir(step: &Step, run_dir: &Path) -> PathBuf {
    match &step.working_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => run_dir.join(dir),
        None => run_dir.to_path_buf(),
    }
}

fn failed_report(job: &Job, cause: FailureCause) -> JobReport {
    JobReport {
        id: job.id.clone(),
        key: job.key.clone(),
        outcome: JobOutcome::Failed,
        skip_reason: None,
        failure: Some(cause),
        steps: Vec::new(),
        started_offset_ms: None,
        duration_ms: 0,
    }
}
