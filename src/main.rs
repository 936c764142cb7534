//! LocalFlow CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow by id or name
//! localflow run ci
//!
//! # Run one job and everything it depends on, in containers
//! localflow run ci --job test --docker
//!
//! # Preview the plan
//! localflow run ci --dry-run
//!
//! # List workflows and their jobs
//! localflow list --tag nightly
//! localflow jobs ci
//!
//! # File-event daemon
//! localflow daemon start
//! localflow daemon status
//! localflow events list --enabled-only
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use localflow::config::{env_flag, Config};
use localflow::daemon::{cancel_on_signal, DaemonController, RegistryStore};
use localflow::events::{EventRegistration, RegistrationFilter};
use localflow::execution::{Engine, JobOutcome, RunReport};
use localflow::output::{OutputConfig, OutputMode, OutputSink};
use localflow::workflow::{load_workflow, DependencyGraph, Workflow, WorkflowRegistry};
use localflow::{WorkflowError, APP_NAME, VERSION};

#[derive(Debug, Parser)]
#[command(name = "localflow", version, about = "Local workflow orchestration")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Configuration file
    #[arg(long, global = true, env = "LOCALFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a workflow
    Run(RunArgs),
    /// List discovered workflows
    List {
        /// Only workflows carrying every given tag
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Show the jobs of a workflow in execution order
    Jobs {
        /// Workflow id, name or file
        workflow: String,
    },
    /// Manage the file-event daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Manage event trigger registrations
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Workflow id, name or file
    workflow: String,

    /// Run only this job and its dependencies
    #[arg(long)]
    job: Option<String>,

    /// Run steps in Docker containers
    #[arg(long)]
    docker: bool,

    /// Write step output to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Where step output goes
    #[arg(long, value_name = "stdout|file|both")]
    output_mode: Option<OutputMode>,

    /// Append to the output file instead of truncating it
    #[arg(long)]
    append: bool,

    /// Print the plan without executing anything
    #[arg(long)]
    dry_run: bool,

    /// Maximum parallel jobs (0 = one per CPU)
    #[arg(long)]
    parallel: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum DaemonAction {
    /// Start the daemon
    Start {
        /// Stay attached to the terminal
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show whether the daemon is running
    Status,
}

#[derive(Debug, Subcommand)]
enum EventsAction {
    /// List event registrations
    List {
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long)]
        enabled_only: bool,
    },
    /// Enable a registration
    Enable { id: String },
    /// Disable a registration
    Disable { id: String },
}

/// Errors that end the process, each with its exit code.
#[derive(Debug)]
enum CliError {
    Workflow(WorkflowError),
    Other(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Workflow(e) => e.exit_code(),
            Self::Other(_) => 1,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow(e) => write!(f, "{}", e),
            Self::Other(message) => f.write_str(message),
        }
    }
}

impl From<WorkflowError> for CliError {
    fn from(e: WorkflowError) -> Self {
        Self::Workflow(e)
    }
}

fn other(e: impl std::fmt::Display) -> CliError {
    CliError::Other(e.to_string())
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(debug: bool, quiet: bool, level: &str) {
    let level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        level
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Finds a workflow by id, name or path to a workflow file.
fn resolve_workflow(config: &Config, target: &str) -> Result<Workflow, CliError> {
    let path = Path::new(target);
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    );
    if is_yaml && path.is_file() {
        debug!("Loading workflow file {}", path.display());
        return Ok(load_workflow(path)?);
    }
    let registry = WorkflowRegistry::discover(&config.workflow_dirs());
    Ok(registry.require(target)?.clone())
}

/// Output settings: config, then the workflow's own section, then CLI flags.
fn output_config(config: &Config, workflow: &Workflow, args: &RunArgs) -> OutputConfig {
    let mut output = match &workflow.output {
        Some(own) => config.output.overlay(own),
        None => config.output.clone(),
    };
    if let Some(file) = &args.output {
        output.file = Some(file.clone());
        if args.output_mode.is_none() {
            output.mode = OutputMode::File;
            output.stdout = true;
        }
    }
    if let Some(mode) = args.output_mode {
        output.mode = mode;
    }
    if args.append {
        output.append = true;
    }
    output
}

fn cmd_run(config: &Config, args: RunArgs) -> Result<u8, CliError> {
    let workflow = resolve_workflow(config, &args.workflow)?;
    info!(
        "Workflow loaded: {} ({} jobs)",
        workflow.name,
        workflow.jobs.len()
    );

    let sink = OutputSink::open(&output_config(config, &workflow, &args))
        .map_err(|e| other(format!("Cannot open output: {}", e)))?;

    let mut engine = Engine::from_config(workflow, config);
    if args.docker {
        engine.set_docker_enabled(true);
    }
    if let Some(parallel) = args.parallel {
        engine.set_max_parallel(parallel);
    }
    engine.set_dry_run(args.dry_run);
    engine.set_output(Arc::new(sink));

    let cancel = CancellationToken::new();
    engine.set_cancel_token(cancel.clone());

    let runtime = tokio::runtime::Runtime::new().map_err(other)?;
    let job = args.job;
    let result = runtime.block_on(async move {
        // SIGINT or SIGTERM cancels the run so step process groups are
        // killed and containers removed before exiting.
        tokio::spawn(cancel_on_signal(cancel.clone()));

        let handle = tokio::task::spawn_blocking(move || match job {
            Some(job) => engine.run_job(&job),
            None => engine.run(),
        });
        let result = handle.await;
        if cancel.is_cancelled() {
            warn!("Run cancelled");
        }
        result
    });

    let report = result.map_err(|e| other(format!("Run aborted: {}", e)))??;
    print_summary(&report);
    Ok(report.exit_code())
}

fn print_summary(report: &RunReport) {
    println!();
    println!(
        "{} {} ({})",
        "Workflow".bold(),
        report.workflow_name,
        report.workflow_id
    );
    for id in report.ordered_ids() {
        let Some(job) = report.job(id) else { continue };
        let label = match job.outcome {
            JobOutcome::Success => "SUCCESS".green(),
            JobOutcome::Failed => "FAILED".red(),
            JobOutcome::Skipped => "SKIPPED".yellow(),
            pending => pending.as_str().normal(),
        };
        let detail = match (&job.failure, &job.skip_reason) {
            (Some(cause), _) => format!(" - {}", cause),
            (None, Some(reason)) => format!(" - {}", reason),
            (None, None) => String::new(),
        };
        println!("  {:<8} {} ({} ms){}", label, job.key, job.duration_ms, detail);
    }

    if !report.dry_run {
        println!();
        print!("{}", report.timeline());
    }

    println!();
    if report.is_success() {
        println!("{}", "Workflow completed successfully".green().bold());
    } else if report.has_infrastructure_failure() {
        println!("{}", "Workflow failed: runner infrastructure error".red().bold());
    } else {
        println!(
            "{}",
            format!("Workflow failed: {} job(s) failed", report.failed_jobs().len())
                .red()
                .bold()
        );
    }
}

fn cmd_list(config: &Config, tags: &[String]) -> Result<u8, CliError> {
    let registry = WorkflowRegistry::discover(&config.workflow_dirs());
    let entries = registry.find_by_tags(tags);
    if entries.is_empty() {
        println!("No workflows found");
        return Ok(0);
    }

    for entry in entries {
        let workflow = &entry.workflow;
        let tags: Vec<&str> = workflow.tags.iter().map(String::as_str).collect();
        println!(
            "{:<24} {:<32} {:>3} jobs  [{}] {}",
            workflow.id.bold(),
            workflow.name,
            workflow.jobs.len(),
            entry.origin,
            tags.join(", ").dimmed()
        );
    }
    Ok(0)
}

fn cmd_jobs(config: &Config, target: &str) -> Result<u8, CliError> {
    let workflow = resolve_workflow(config, target)?;
    let graph = DependencyGraph::build(&workflow)?;

    println!("{} ({})", workflow.name.bold(), workflow.id);
    for (index, layer) in graph.order().iter().enumerate() {
        println!("Layer {}:", index + 1);
        for job in layer.iter().filter_map(|id| workflow.get_job(id)) {
            let needs = if job.needs.is_empty() {
                String::new()
            } else {
                format!(" needs: {}", job.needs.join(", "))
            };
            let condition = job
                .condition
                .as_ref()
                .map(|c| format!(" if: {}", c))
                .unwrap_or_default();
            println!(
                "  {} ({}) {} steps{}{}",
                job.key,
                job.id,
                job.steps.len(),
                needs.dimmed(),
                condition.dimmed()
            );
        }
    }
    Ok(0)
}

fn cmd_daemon(
    config: Config,
    config_path: Option<&Path>,
    action: DaemonAction,
) -> Result<u8, CliError> {
    let controller = DaemonController::from_config(&config);
    match action {
        DaemonAction::Start { foreground: true } => {
            controller.run_foreground(config).map_err(other)?;
            Ok(0)
        }
        DaemonAction::Start { foreground: false } => {
            let pid = controller.spawn_background(config_path).map_err(other)?;
            println!(
                "Daemon started (pid {}), log: {}",
                pid,
                controller.log_file().display()
            );
            Ok(0)
        }
        DaemonAction::Stop => {
            let pid = controller.stop().map_err(other)?;
            println!("Daemon stopped (pid {})", pid);
            Ok(0)
        }
        DaemonAction::Status => {
            let status = controller.status();
            match status.pid {
                Some(pid) => println!("Daemon is {} (pid {})", "running".green(), pid),
                None => println!("Daemon is {}", "not running".yellow()),
            }
            Ok(0)
        }
    }
}

fn print_registration(registration: &EventRegistration) {
    let state = if registration.enabled {
        "enabled".green()
    } else {
        "disabled".yellow()
    };
    let last = registration
        .last_triggered
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let paths: Vec<String> = registration
        .paths
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    println!(
        "{}  {:<8} {:<8} {:<20} {}  last: {}",
        registration.id,
        state,
        registration.kind,
        registration.workflow_id,
        paths.join(", "),
        last
    );
}

fn cmd_events(config: &Config, action: EventsAction) -> Result<u8, CliError> {
    let store = RegistryStore::new(config.events_file());
    match action {
        EventsAction::List {
            workflow,
            enabled_only,
        } => {
            let workflows = WorkflowRegistry::discover(&config.workflow_dirs());
            let filter = RegistrationFilter {
                workflow,
                enabled_only,
            };
            let registrations = store
                .update(|events| {
                    events.sync(&workflows);
                    events
                        .list(&filter)
                        .into_iter()
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .map_err(other)?;
            if registrations.is_empty() {
                println!("No event registrations");
            }
            for registration in &registrations {
                print_registration(registration);
            }
            Ok(0)
        }
        EventsAction::Enable { id } => {
            let registration = store
                .update(|events| events.enable(&id).cloned())
                .map_err(other)?
                .map_err(other)?;
            print_registration(&registration);
            Ok(0)
        }
        EventsAction::Disable { id } => {
            let registration = store
                .update(|events| events.disable(&id).cloned())
                .map_err(other)?
                .map_err(other)?;
            print_registration(&registration);
            Ok(0)
        }
    }
}

/// Main application entry point; returns the process exit code.
fn run(cli: Cli) -> Result<u8, CliError> {
    let loaded = Config::load(cli.config.as_deref());
    let level = loaded
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    setup_logging(
        cli.debug || env_flag("LOCALFLOW_DEBUG"),
        cli.quiet || env_flag("LOCALFLOW_QUIET"),
        &level,
    );
    let config = loaded.map_err(other)?;
    debug!("{} v{}", APP_NAME, VERSION);

    match cli.command {
        Command::Run(args) => cmd_run(&config, args),
        Command::List { tags } => cmd_list(&config, &tags),
        Command::Jobs { workflow } => cmd_jobs(&config, &workflow),
        Command::Daemon { action } => cmd_daemon(config, cli.config.as_deref(), action),
        Command::Events { action } => cmd_events(&config, action),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
