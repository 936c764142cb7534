//! Background Daemon
//!
//! Watches the file system for the events declared by workflows and runs the
//! matching workflows.
//!
//! - [`pidfile`]: PID file ownership and liveness checks
//! - [`controller`]: start/stop/status from the command line
//! - [`service`]: discovery loop that keeps the watcher current
//! - [`dispatch`]: bounded execution of queued run requests

pub mod controller;
pub mod dispatch;
pub mod pidfile;
pub mod service;

use std::path::PathBuf;

use thiserror::Error;

use crate::events::EventError;

pub use controller::{cancel_on_signal, DaemonController, DaemonStatus};
pub use dispatch::Dispatcher;
pub use pidfile::{is_alive, PidFile, PidGuard};
pub use service::{DaemonService, RegistryStore};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("Daemon is not running")]
    NotRunning,

    #[error("Daemon I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to start daemon process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Events(#[from] EventError),
}
