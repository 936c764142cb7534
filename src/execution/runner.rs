//! Step Runners
//!
//! A runner executes one step command and reports how it ended. A nonzero
//! exit is a normal [`StepOutcome`]; only failures to run the command at all
//! are [`RunnerError`]s.
//!
//! - [`LocalRunner`](super::local::LocalRunner): `<shell> -c <command>` on the host
//! - [`ContainerRunner`](super::container::ContainerRunner): `docker run ... sh -c <command>`

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::workflow::Step;

/// How often a supervised child is polled for exit and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Result of running one step command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// The command was aborted through the cancellation token
    pub cancelled: bool,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }
}

/// The runner could not execute the command.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Working directory '{}' does not exist", .0.display())]
    MissingWorkdir(PathBuf),

    #[error("Lost track of step process: {0}")]
    Wait(#[source] io::Error),

    #[error("Container runtime failed: {0}")]
    Infrastructure(String),
}

/// Which runner executes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Local,
    Container,
}

impl RunnerKind {
    /// `local: true` always wins; otherwise the run-level docker flag decides.
    pub fn select(step: &Step, docker_enabled: bool) -> Self {
        if step.local || !docker_enabled {
            Self::Local
        } else {
            Self::Container
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
        }
    }
}

/// Everything a runner needs to execute one step.
#[derive(Debug, Clone)]
pub struct StepRequest<'a> {
    pub job_id: &'a str,
    pub step_name: &'a str,
    pub command: &'a str,
    pub shell: &'a str,
    /// Declared environment after the workflow/job/step cascade
    pub env: &'a BTreeMap<String, String>,
    pub workdir: &'a Path,
    pub image: &'a str,
}

/// Executes step commands.
pub trait Runner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Runs the command to completion, aborting it when `cancel` fires.
    fn execute(
        &self,
        request: &StepRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, RunnerError>;
}

/// A finished child process with its captured output.
pub(crate) struct Supervised {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
}

/// Waits for `child`, draining its pipes and calling `on_cancel` once if the
/// token fires first.
pub(crate) fn supervise(
    mut child: Child,
    cancel: &CancellationToken,
    mut on_cancel: impl FnMut(&mut Child),
) -> Result<Supervised, RunnerError> {
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let mut cancelled = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                return Err(RunnerError::Wait(e));
            }
        }
        if !cancelled && cancel.is_cancelled() {
            cancelled = true;
            debug!("Cancelling process {}", child.id());
            on_cancel(&mut child);
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(Supervised {
        status,
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        cancelled,
    })
}

/// Kills the process group led by `child`, then the child itself.
pub(crate) fn kill_group(child: &mut Child) {
    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", child.id(), e);
    }
    let _ = child.kill();
}

/// Exit code of a finished process; signals map to `128 + signo`.
pub(crate) fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf) {
            warn!("Failed to read step output: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default()
}
