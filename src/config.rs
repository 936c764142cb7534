//! Configuration
//!
//! Global settings loaded from YAML. Every field has a default, so an empty
//! or missing file yields a usable configuration.
//!
//! # Resolution Priority
//!
//! The configuration file is resolved in the following order:
//! 1. The `--config` command-line argument
//! 2. The `LOCALFLOW_CONFIG` environment variable
//! 3. Project config: `./.localflow/config.yaml`
//! 4. User config: `~/.localflow/config.yaml`
//! 5. Built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::container::DEFAULT_IMAGE;
use crate::execution::engine::DEFAULT_MAX_PARALLEL;
use crate::output::OutputConfig;
use crate::workflow::WorkflowOrigin;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "LOCALFLOW_CONFIG";

/// Directory name used under the home and project directories.
pub const APP_DIR: &str = ".localflow";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file '{}' not found", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read configuration '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration '{origin}': {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// `~/.localflow`, or `./.localflow` when no home directory is known.
pub fn app_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Interprets `1`, `true`, `yes` and `on` (any case) as true.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Reads a boolean flag from the environment.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| is_truthy(&v)).unwrap_or(false)
}

/// Settings for the background daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Defaults to `<log_dir>/localflow.pid`
    pub pid_file: Option<PathBuf>,
    /// Defaults to `<log_dir>/monitor.log`
    pub log_file: Option<PathBuf>,
    /// Seconds between workflow rediscoveries
    pub check_interval_secs: u64,
    pub debounce_ms: u64,
    pub queue_capacity: usize,
    /// Runs dispatched at once; `1` serializes triggered runs
    pub max_concurrent_runs: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            log_file: None,
            check_interval_secs: 60,
            debounce_ms: 500,
            queue_capacity: 256,
            max_concurrent_runs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User-wide workflow directory
    pub workflows_dir: PathBuf,
    /// Project workflow directory, relative to the current directory
    pub local_workflows_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub docker_enabled: bool,
    pub docker_default_image: String,
    pub docker_binary: Option<PathBuf>,
    pub default_shell: Option<String>,
    /// `0` means one job per CPU
    pub max_parallel: usize,
    pub output: OutputConfig,
    pub monitor: MonitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        let home = app_home();
        Self {
            workflows_dir: home.join("workflows"),
            local_workflows_dir: Path::new(APP_DIR).join("workflows"),
            log_dir: home.join("logs"),
            log_level: "info".to_string(),
            docker_enabled: false,
            docker_default_image: DEFAULT_IMAGE.to_string(),
            docker_binary: None,
            default_shell: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
            output: OutputConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Finds the configuration file to use, if any.
    ///
    /// An explicit path or `LOCALFLOW_CONFIG` is returned even when the file
    /// does not exist; the default locations only when they do.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(expand_tilde(path));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Some(expand_tilde(Path::new(path.trim())));
            }
        }
        [
            Path::new(APP_DIR).join("config.yaml"),
            app_home().join("config.yaml"),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
    }

    /// Loads the configuration following the resolution priority.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::locate(explicit) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content, &path.display().to_string())?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses YAML text; an empty document yields the defaults.
    pub fn from_yaml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                origin: origin.to_string(),
                source,
            })?
        };
        Ok(config.expanded())
    }

    fn expanded(mut self) -> Self {
        self.workflows_dir = expand_tilde(&self.workflows_dir);
        self.local_workflows_dir = expand_tilde(&self.local_workflows_dir);
        self.log_dir = expand_tilde(&self.log_dir);
        self.docker_binary = self.docker_binary.map(|p| expand_tilde(&p));
        self.output.file = self.output.file.map(|p| expand_tilde(&p));
        self.monitor.pid_file = self.monitor.pid_file.map(|p| expand_tilde(&p));
        self.monitor.log_file = self.monitor.log_file.map(|p| expand_tilde(&p));
        self
    }

    /// Workflow directories in discovery order; later entries override
    /// earlier ones on id collisions.
    pub fn workflow_dirs(&self) -> Vec<(PathBuf, WorkflowOrigin)> {
        vec![
            (self.workflows_dir.clone(), WorkflowOrigin::Global),
            (self.local_workflows_dir.clone(), WorkflowOrigin::Local),
        ]
    }

    pub fn pid_file(&self) -> PathBuf {
        self.monitor
            .pid_file
            .clone()
            .unwrap_or_else(|| self.log_dir.join("localflow.pid"))
    }

    pub fn monitor_log_file(&self) -> PathBuf {
        self.monitor
            .log_file
            .clone()
            .unwrap_or_else(|| self.log_dir.join("monitor.log"))
    }

    /// Location of the persisted event registrations.
    pub fn events_file(&self) -> PathBuf {
        self.log_dir.join("events.json")
    }
}
