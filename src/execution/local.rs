//! Local Runner
//!
//! Runs step commands on the host through `<shell> -c`. The child inherits
//! the process environment with the declared variables layered on top, and
//! gets its own process group so cancellation reaches its descendants too.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use log::debug;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use super::runner::{
    exit_code, kill_group, supervise, Runner, RunnerError, RunnerKind, StepOutcome, StepRequest,
};

/// Shell used when neither the step nor the config names one.
///
/// `/bin/bash` when present, `/bin/sh` otherwise.
pub static DEFAULT_SHELL: Lazy<PathBuf> = Lazy::new(|| {
    let bash = Path::new("/bin/bash");
    if bash.exists() {
        bash.to_path_buf()
    } else {
        debug!("/bin/bash not found, falling back to /bin/sh");
        PathBuf::from("/bin/sh")
    }
});

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for LocalRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    fn execute(
        &self,
        request: &StepRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, RunnerError> {
        if !request.workdir.is_dir() {
            return Err(RunnerError::MissingWorkdir(request.workdir.to_path_buf()));
        }

        debug!(
            "[{}] {} (local, cwd {}): {} -c {}",
            request.job_id,
            request.step_name,
            request.workdir.display(),
            request.shell,
            request.command
        );

        let started = Instant::now();
        let child = Command::new(request.shell)
            .arg("-c")
            .arg(request.command)
            .current_dir(request.workdir)
            .envs(request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: request.shell.to_string(),
                source,
            })?;

        let result = supervise(child, cancel, kill_group)?;
        let outcome = StepOutcome {
            exit_code: exit_code(&result.status),
            stdout: result.stdout,
            stderr: result.stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled: result.cancelled,
        };

        debug!(
            "[{}] {} exited with {} after {} ms",
            request.job_id, request.step_name, outcome.exit_code, outcome.duration_ms
        );
        Ok(outcome)
    }
}
