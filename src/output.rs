//! Output Routing
//!
//! Captured step output goes to stdout, a file, or both. The file is either
//! truncated when a run starts or appended to. The sink is shared by the jobs
//! of one run, so writes are serialized behind a mutex.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use log::warn;
use serde::{Deserialize, Serialize};

/// Where captured output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Stdout,
    File,
    Both,
}

impl std::str::FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown output mode '{}' (stdout, file, both)", other)),
        }
    }
}

/// Output settings (global config, workflow override, CLI override).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Target file for `file` and `both` modes
    pub file: Option<PathBuf>,
    pub mode: OutputMode,
    /// Also echo to stdout in `file` mode
    pub stdout: bool,
    /// Append to the file instead of truncating it
    pub append: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            file: None,
            mode: OutputMode::Stdout,
            stdout: false,
            append: false,
        }
    }
}

impl OutputConfig {
    /// Applies `other` on top of `self`. Mode, stdout echo and append always
    /// come from `other`; the file falls back to `self` when `other` has none.
    pub fn overlay(&self, other: &OutputConfig) -> OutputConfig {
        OutputConfig {
            file: other.file.clone().or_else(|| self.file.clone()),
            mode: other.mode,
            stdout: other.stdout,
            append: other.append,
        }
    }

    fn writes_stdout(&self) -> bool {
        match self.mode {
            OutputMode::Stdout | OutputMode::Both => true,
            OutputMode::File => self.stdout,
        }
    }
}

/// Destination for captured step output.
#[derive(Debug)]
pub struct OutputSink {
    stdout: bool,
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl OutputSink {
    /// Stdout-only sink.
    pub fn stdout() -> Self {
        Self {
            stdout: true,
            file: None,
            path: None,
        }
    }

    /// Sink that discards everything.
    pub fn silent() -> Self {
        Self {
            stdout: false,
            file: None,
            path: None,
        }
    }

    /// Opens the sink described by `config`, creating parent directories.
    pub fn open(config: &OutputConfig) -> io::Result<Self> {
        let wants_file = matches!(config.mode, OutputMode::File | OutputMode::Both);
        let (file, path) = match (&config.file, wants_file) {
            (Some(path), true) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(config.append)
                    .truncate(!config.append)
                    .open(path)?;
                (Some(Mutex::new(file)), Some(path.clone()))
            }
            (None, true) => {
                warn!("Output mode {:?} requested without a file; using stdout", config.mode);
                (None, None)
            }
            _ => (None, None),
        };

        Ok(Self {
            stdout: config.writes_stdout() || (wants_file && file.is_none()),
            file,
            path,
        })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Writes text to every configured destination.
    pub fn write(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.stdout {
            let mut out = io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = file.write_all(text.as_bytes()).and_then(|_| file.flush()) {
                warn!("Failed to write step output: {}", e);
            }
        }
    }

    /// Writes one step's captured output under a header line.
    pub fn write_step(&self, job: &str, step: &str, stdout: &str, stderr: &str) {
        if stdout.is_empty() && stderr.is_empty() {
            return;
        }
        let mut block = format!("==> [{}] {}\n", job, step);
        for text in [stdout, stderr] {
            if text.is_empty() {
                continue;
            }
            block.push_str(text);
            if !text.ends_with('\n') {
                block.push('\n');
            }
        }
        self.write(&block);
    }
}
