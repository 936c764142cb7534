//! Daemon Controller
//!
//! Command-line side of the daemon: start it in the foreground or as a
//! detached background process, stop it, report its status.

use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

use super::pidfile::{is_alive, PidFile};
use super::service::DaemonService;
use super::DaemonError;

/// Time a daemon gets to exit after SIGTERM before it is killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DaemonController {
    pid_file: PidFile,
    log_file: PathBuf,
    stop_timeout: Duration,
}

impl DaemonController {
    pub fn new(pid_file: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: PidFile::new(pid_file),
            log_file: log_file.into(),
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pid_file(), config.monitor_log_file())
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Whether a live daemon owns the PID file; stale files are removed.
    pub fn status(&self) -> DaemonStatus {
        let pid = self.pid_file.live_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
        }
    }

    /// Sends SIGTERM, escalating to SIGKILL after the stop timeout.
    /// Returns the pid of the stopped daemon.
    pub fn stop(&self) -> Result<u32, DaemonError> {
        let pid = self.pid_file.live_pid().ok_or(DaemonError::NotRunning)?;
        let target = Pid::from_raw(pid as i32);

        info!("Sending SIGTERM to daemon (pid {})", pid);
        kill(target, Signal::SIGTERM).map_err(|source| DaemonError::Signal { pid, source })?;

        if !wait_for_exit(pid, self.stop_timeout) {
            warn!(
                "Daemon (pid {}) still running after {:?}, sending SIGKILL",
                pid, self.stop_timeout
            );
            kill(target, Signal::SIGKILL).map_err(|source| DaemonError::Signal { pid, source })?;
            wait_for_exit(pid, Duration::from_secs(2));
        }

        self.pid_file.remove()?;
        info!("Daemon stopped (pid {})", pid);
        Ok(pid)
    }

    /// Re-executes this binary as `daemon start --foreground` in its own
    /// process group with output appended to the log file.
    pub fn spawn_background(&self, config_path: Option<&Path>) -> Result<u32, DaemonError> {
        if let Some(pid) = self.pid_file.live_pid() {
            return Err(DaemonError::AlreadyRunning(pid));
        }

        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DaemonError::Io { path, source }
        };

        if let Some(parent) = self.log_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(io_error(&self.log_file))?;
        let log_err = log.try_clone().map_err(io_error(&self.log_file))?;

        let exe = std::env::current_exe().map_err(DaemonError::Spawn)?;
        let mut command = Command::new(exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        command
            .args(["daemon", "start", "--foreground"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let child = command.spawn().map_err(DaemonError::Spawn)?;
        let pid = child.id();
        info!(
            "Daemon started in background (pid {}), logging to {}",
            pid,
            self.log_file.display()
        );
        Ok(pid)
    }

    /// Runs the daemon in this process until SIGINT or SIGTERM.
    pub fn run_foreground(&self, config: Config) -> Result<(), DaemonError> {
        let _guard = self.pid_file.acquire()?;
        info!(
            "Daemon running in foreground (pid {}, pid file {})",
            std::process::id(),
            self.pid_file.path().display()
        );

        let runtime = tokio::runtime::Runtime::new().map_err(DaemonError::Runtime)?;
        runtime.block_on(async move {
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));
            // The service blocks in place while refreshing, so it must run
            // on a worker thread rather than inside block_on.
            tokio::spawn(DaemonService::new(config).run(cancel))
                .await
                .map_err(|e| DaemonError::Runtime(std::io::Error::other(e)))?
        })
    }
}

/// Cancels `token` on SIGINT or SIGTERM.
///
/// Returns without cancelling if the token is cancelled elsewhere first.
pub async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }
    !is_alive(pid)
}
