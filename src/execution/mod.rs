//! Workflow Execution Module
//!
//! Provides the engine that runs a resolved workflow, the runners that
//! execute step commands, and the per-run state and report.
//!
//! # Architecture
//!
//! - [`engine`]: Layered, parallel job scheduling with skip rules
//! - [`runner`]: Runner contract and process supervision
//! - [`local`]: Host shell runner
//! - [`container`]: Docker runner with guaranteed container removal
//! - [`env`]: Environment cascade
//! - [`state`]: Job outcomes of one run
//! - [`report`]: Run result returned to callers

pub mod container;
pub mod engine;
pub mod env;
pub mod local;
pub mod report;
pub mod runner;
pub mod state;

pub use container::{ContainerGuard, ContainerRunner};
pub use engine::Engine;
pub use env::{cascade, EnvStack};
pub use local::LocalRunner;
pub use report::{FailureCause, JobReport, RunReport, SkipReason, StepReport};
pub use runner::{Runner, RunnerError, RunnerKind, StepOutcome, StepRequest};
pub use state::{JobOutcome, RunState};
