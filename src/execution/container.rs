//! Container Runner
//!
//! Runs step commands inside a Docker container:
//!
//! ```text
//! docker run --name localflow-<pid>-<n> -v <wd>:<wd> -w <wd> -e K=V ... <image> sh -c <command>
//! ```
//!
//! Containers are never started with `--rm`. A [`ContainerGuard`] removes the
//! container with `docker rm -f` when it goes out of scope, which covers
//! success, failure, cancellation and unwinding alike.
//!
//! # Binary Resolution
//!
//! The Docker CLI is resolved in the following order:
//! 1. `docker_binary` from the configuration
//! 2. `docker` found on the system PATH
//! 3. Plain `docker`, left to the OS to resolve

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use super::runner::{
    exit_code, kill_group, supervise, Runner, RunnerError, RunnerKind, StepOutcome, StepRequest,
};

/// Image used when no step, job or workflow names one.
pub const DEFAULT_IMAGE: &str = "ubuntu:latest";

/// Exit code the Docker CLI uses for its own failures.
const DOCKER_FAILURE_EXIT: i32 = 125;

/// Lazily-resolved path to the Docker CLI on the system PATH.
pub static DOCKER_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(output) = Command::new("which").arg("docker").output() {
        if output.status.success() {
            let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path_str.is_empty() {
                info!("Using system docker: {}", path_str);
                return PathBuf::from(path_str);
            }
        }
    }

    warn!("docker not found on PATH");
    PathBuf::from("docker")
});

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Removes a named container when dropped.
pub struct ContainerGuard {
    binary: PathBuf,
    name: String,
}

impl ContainerGuard {
    pub fn new(binary: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let status = Command::new(&self.binary)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(s) if s.success() => debug!("Removed container {}", self.name),
            Ok(s) => debug!("docker rm -f {} exited with {}", self.name, s),
            Err(e) => warn!("Failed to remove container {}: {}", self.name, e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRunner {
    binary: PathBuf,
}

impl Default for ContainerRunner {
    fn default() -> Self {
        Self::new(DOCKER_PATH.clone())
    }
}

impl ContainerRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Unique container name for this process.
    pub fn container_name() -> String {
        format!(
            "localflow-{}-{}",
            process::id(),
            CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Arguments passed to the Docker CLI for one step.
    pub fn run_args(request: &StepRequest<'_>, name: &str, workdir: &Path) -> Vec<String> {
        let wd = workdir.display().to_string();
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:{}", wd, wd),
            "-w".to_string(),
            wd,
        ];
        for (key, value) in request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.image.to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(request.command.to_string());
        args
    }

    fn kill_container(&self, name: &str) {
        let result = Command::new(&self.binary)
            .args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            warn!("Failed to kill container {}: {}", name, e);
        }
    }
}

impl Runner for ContainerRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Container
    }

    fn execute(
        &self,
        request: &StepRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, RunnerError> {
        let workdir = request
            .workdir
            .canonicalize()
            .map_err(|_| RunnerError::MissingWorkdir(request.workdir.to_path_buf()))?;

        let name = Self::container_name();
        let args = Self::run_args(request, &name, &workdir);
        debug!(
            "[{}] {} (container {} from {}): {}",
            request.job_id, request.step_name, name, request.image, request.command
        );

        let started = Instant::now();
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.binary.display().to_string(),
                source,
            })?;

        let guard = ContainerGuard::new(&self.binary, name);
        let result = supervise(child, cancel, |child| {
            self.kill_container(guard.name());
            kill_group(child);
        })?;

        let code = exit_code(&result.status);
        if code == DOCKER_FAILURE_EXIT && !result.cancelled {
            return Err(RunnerError::Infrastructure(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                code,
                result.stderr.trim()
            )));
        }

        Ok(StepOutcome {
            exit_code: code,
            stdout: result.stdout,
            stderr: result.stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled: result.cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Writes a fake docker CLI that logs its arguments, then behaves per `run_body`.
    fn fake_docker(dir: &TempDir, run_body: &str) -> (PathBuf, PathBuf) {
        let log = dir.path().join("docker.log");
        let script = dir.path().join("docker");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\nif [ \"$1\" = run ]; then\n{}\nfi\nexit 0\n",
                log.display(),
                run_body
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn request<'a>(env: &'a BTreeMap<String, String>, workdir: &'a Path) -> StepRequest<'a> {
        StepRequest {
            job_id: "build",
            step_name: "compile",
            command: "make all",
            shell: "/bin/sh",
            env,
            workdir,
            image: "alpine:3",
        }
    }

    #[test]
    fn test_run_args() {
        let env = BTreeMap::from([("A".to_string(), "1".to_string())]);
        let workdir = Path::new("/work");
        let args = ContainerRunner::run_args(&request(&env, workdir), "c1", workdir);
        assert_eq!(
            args,
            vec![
                "run", "--name", "c1", "-v", "/work:/work", "-w", "/work", "-e", "A=1",
                "alpine:3", "sh", "-c", "make all"
            ]
        );
    }

    #[test]
    fn test_container_names_are_unique() {
        assert_ne!(ContainerRunner::container_name(), ContainerRunner::container_name());
    }

    #[test]
    fn test_exit_code_passthrough_and_removal() {
        let dir = tempdir().unwrap();
        let (docker, log) = fake_docker(&dir, "echo built\nexit 3");
        let env = BTreeMap::new();

        let outcome = ContainerRunner::new(&docker)
            .execute(&request(&env, dir.path()), &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stdout, "built\n");
        let calls = fs::read_to_string(&log).unwrap();
        assert!(calls.lines().any(|l| l.starts_with("rm -f localflow-")));
    }

    #[test]
    fn test_docker_failure_is_infrastructure() {
        let dir = tempdir().unwrap();
        let (docker, log) = fake_docker(&dir, "echo 'pull access denied' >&2\nexit 125");
        let env = BTreeMap::new();

        let err = ContainerRunner::new(&docker)
            .execute(&request(&env, dir.path()), &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(err, RunnerError::Infrastructure(ref m) if m.contains("pull access denied")));
        assert!(fs::read_to_string(&log).unwrap().contains("rm -f localflow-"));
    }

    #[test]
    fn test_cancel_removes_container() {
        let dir = tempdir().unwrap();
        let (docker, log) = fake_docker(&dir, "sleep 30");
        let env = BTreeMap::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = ContainerRunner::new(&docker)
            .execute(&request(&env, dir.path()), &cancel)
            .unwrap();

        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));

        let calls = fs::read_to_string(&log).unwrap();
        let name = calls
            .lines()
            .find_map(|l| l.strip_prefix("run --name "))
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap()
            .to_string();
        assert!(calls.contains(&format!("kill {}", name)));
        assert!(calls.contains(&format!("rm -f {}", name)));
    }

    #[test]
    #[ignore = "requires a working Docker daemon"]
    fn test_real_docker_run() {
        let dir = tempdir().unwrap();
        let env = BTreeMap::from([("WHO".to_string(), "container".to_string())]);
        let mut req = request(&env, dir.path());
        req.command = "echo hello $WHO";

        let outcome = ContainerRunner::default()
            .execute(&req, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "hello container");
    }
}
