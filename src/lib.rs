//! LocalFlow - Local Workflow Orchestration
//!
//! Runs multi-job workflows described in YAML on the local machine. Jobs
//! declare dependencies and conditions, steps run in a local shell or in a
//! Docker container, and workflows can be triggered automatically by
//! file-system events through a background daemon.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow model, YAML parsing, validation, dependency graph
//!   and condition expressions
//! - [`execution`]: Parallel engine, environment cascade, local and container
//!   runners, run reports
//! - [`events`]: File watch filters, debouncing and the trigger queue
//! - [`daemon`]: PID file lifecycle, discovery loop and run dispatch
//! - [`config`]: User configuration
//! - [`output`]: Step output routing
//!
//! # Example
//!
//! ```rust,no_run
//! use localflow::execution::Engine;
//! use localflow::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow(".localflow/workflows/ci.yml")?;
//!
//!     let mut engine = Engine::new(workflow);
//!     engine.set_max_parallel(4);
//!
//!     let report = engine.run()?;
//!     if !report.is_success() {
//!         eprintln!("failed jobs: {:?}", report.failed_jobs());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod execution;
pub mod output;
pub mod workflow;

pub use config::Config;
pub use error::{WorkflowError, WorkflowResult};
pub use execution::{Engine, RunReport};
pub use workflow::{load_workflow, parse_workflow, Job, Step, Workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "LocalFlow";
