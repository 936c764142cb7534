//! PID File
//!
//! A PID file names the live daemon. Stale files (the process is gone or a
//! zombie) are removed as soon as they are noticed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use log::{debug, warn};
use sysinfo::{Pid, ProcessStatus, System};

use super::DaemonError;

/// Whether `pid` names a running, non-zombie process.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the file, if it holds one.
    pub fn read(&self) -> Option<u32> {
        let content = fs::read_to_string(&self.path).ok()?;
        match content.trim().parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                warn!("PID file {} holds '{}'", self.path.display(), content.trim());
                None
            }
        }
    }

    pub fn write(&self, pid: u32) -> Result<(), DaemonError> {
        let io_error = |source| DaemonError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }
        fs::write(&self.path, format!("{}\n", pid)).map_err(io_error)
    }

    pub fn remove(&self) -> Result<(), DaemonError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DaemonError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// PID of the live daemon; a stale file is removed.
    pub fn live_pid(&self) -> Option<u32> {
        let exists = self.path.exists();
        match self.read() {
            Some(pid) if is_alive(pid) => Some(pid),
            _ if exists => {
                debug!("Removing stale PID file {}", self.path.display());
                if let Err(e) = self.remove() {
                    warn!("{}", e);
                }
                None
            }
            _ => None,
        }
    }

    /// Records the current process, refusing when another daemon is live.
    pub fn acquire(&self) -> Result<PidGuard, DaemonError> {
        if let Some(pid) = self.live_pid() {
            if pid != process::id() {
                return Err(DaemonError::AlreadyRunning(pid));
            }
        }
        self.write(process::id())?;
        Ok(PidGuard { file: self.clone() })
    }
}

/// Removes the PID file on drop if it still names this process.
#[derive(Debug)]
pub struct PidGuard {
    file: PidFile,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if self.file.read() == Some(process::id()) {
            if let Err(e) = self.file.remove() {
                warn!("{}", e);
            }
        }
    }
}
