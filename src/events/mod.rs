//! Event Trigger Subsystem
//!
//! Turns file-system changes into workflow runs:
//! - `filter`: watch filters (location, patterns, owner/group, size)
//! - `trigger`: event kinds and compiled triggers
//! - `debounce`: per-(registration, path) burst collapsing
//! - `queue`: bounded hand-off to the daemon dispatcher
//! - `watcher`: notify-backed watching and routing
//! - `registry`: persisted trigger registrations

pub mod debounce;
pub mod filter;
pub mod queue;
pub mod registry;
pub mod trigger;
pub mod watcher;

use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;

pub use debounce::Debouncer;
pub use filter::{FileFacts, FilePattern, WatchFilter, WatchFilterSpec};
pub use queue::{PushOutcome, TriggerQueue};
pub use registry::{EventRegistration, EventRegistry, RegistrationFilter};
pub use trigger::{EventKind, EventTrigger, EventTriggerSpec, FsEvent};
pub use watcher::{ActiveTrigger, EventWatcher, TriggerRouter};

/// Errors raised by the event subsystem.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Failed to watch '{}': {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Event registration '{0}' not found")]
    RegistrationNotFound(String),

    #[error("Event registry I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Event registry at '{}' is not valid JSON: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A request to run a workflow, produced by a matched trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub workflow_id: String,
    /// Jobs to run; empty means the whole workflow
    pub job_ids: Vec<String>,
    /// File that caused the trigger
    pub path: PathBuf,
    pub kind: EventKind,
    pub registration_id: String,
    pub enqueued_at: Instant,
}

impl RunRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        job_ids: Vec<String>,
        path: impl Into<PathBuf>,
        kind: EventKind,
        registration_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            job_ids,
            path: path.into(),
            kind,
            registration_id: registration_id.into(),
            enqueued_at: Instant::now(),
        }
    }

    /// Whether two requests would start the same run.
    pub fn same_target(&self, other: &RunRequest) -> bool {
        self.workflow_id == other.workflow_id && self.job_ids == other.job_ids
    }
}
