//! End-to-end scenarios: real shell steps through the engine, a fake docker
//! CLI for the container runner, and the daemon reacting to a real file.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

use localflow::config::Config;
use localflow::daemon::DaemonService;
use localflow::events::{
    ActiveTrigger, EventKind, EventTrigger, FsEvent, TriggerQueue, TriggerRouter, WatchFilter,
};
use localflow::execution::{Engine, JobOutcome, SkipReason};
use localflow::output::OutputSink;
use localflow::parse_workflow;

fn engine(yaml: &str, dir: &Path) -> Engine {
    let workflow = parse_workflow(yaml, None).unwrap();
    let mut engine = Engine::new(workflow);
    engine.set_working_dir(dir);
    engine.set_output(Arc::new(OutputSink::silent()));
    engine
}

#[test]
fn test_dependency_runs_first() {
    let dir = tempdir().unwrap();
    let yaml = r#"
id: ordered
jobs:
  test:
    needs: setup
    steps:
      - run: echo test >> trace.txt
  setup:
    steps:
      - run: echo setup >> trace.txt
"#;
    let report = engine(yaml, dir.path()).run().unwrap();

    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("trace.txt")).unwrap(),
        "setup\ntest\n"
    );
    let keys: Vec<&str> = report
        .ordered_ids()
        .into_iter()
        .map(|id| report.job(id).unwrap().key.as_str())
        .collect();
    assert_eq!(keys, vec!["setup", "test"]);
}

#[test]
fn test_failed_dependency_skips_dependent() {
    let dir = tempdir().unwrap();
    let yaml = r#"
id: broken
jobs:
  build:
    steps:
      - run: exit 1
  deploy:
    needs: build
    steps:
      - run: touch deployed
"#;
    let report = engine(yaml, dir.path()).run().unwrap();

    assert_eq!(report.job("build").unwrap().outcome, JobOutcome::Failed);
    let deploy = report.job("deploy").unwrap();
    assert_eq!(deploy.outcome, JobOutcome::Skipped);
    assert!(matches!(
        deploy.skip_reason,
        Some(SkipReason::DependencyNotSatisfied { .. })
    ));
    assert!(!dir.path().join("deployed").exists());
    assert_eq!(report.exit_code(), 4);
}

#[test]
fn test_negated_condition_runs_after_failure() {
    let dir = tempdir().unwrap();
    let yaml = r#"
id: recovery
jobs:
  build:
    steps:
      - run: exit 2
  cleanup:
    if: not build
    steps:
      - run: touch cleaned
"#;
    let report = engine(yaml, dir.path()).run().unwrap();

    assert_eq!(report.job("cleanup").unwrap().outcome, JobOutcome::Success);
    assert!(dir.path().join("cleaned").exists());
    assert!(!report.is_success());
}

#[test]
fn test_selective_run_executes_closure() {
    let dir = tempdir().unwrap();
    let yaml = r#"
id: selective
jobs:
  fetch:
    steps:
      - run: touch fetch
  build:
    needs: fetch
    steps:
      - run: touch build
  publish:
    needs: build
    steps:
      - run: touch publish
  lint:
    steps:
      - run: touch lint
"#;
    let report = engine(yaml, dir.path()).run_job("build").unwrap();

    assert!(report.is_success());
    assert_eq!(report.jobs.len(), 2);
    assert!(dir.path().join("fetch").exists());
    assert!(dir.path().join("build").exists());
    assert!(!dir.path().join("publish").exists());
    assert!(!dir.path().join("lint").exists());
}

#[test]
fn test_environment_cascade() {
    let dir = tempdir().unwrap();
    let yaml = r#"
id: cascade
env:
  A: "1"
  B: "1"
jobs:
  show:
    env:
      A: "2"
    steps:
      - run: echo "A=$A B=$B" > env.txt
        env:
          B: "2"
"#;
    let report = engine(yaml, dir.path()).run().unwrap();

    assert!(report.is_success());
    assert_eq!(
        fs::read_to_string(dir.path().join("env.txt")).unwrap(),
        "A=2 B=2\n"
    );
}

#[test]
fn test_burst_of_events_triggers_once() {
    let dir = tempdir().unwrap();
    let inbox = dir.path().join("inbox");
    let queue = Arc::new(TriggerQueue::new(8));
    let trigger = EventTrigger::new(
        EventKind::Modify,
        "ingest",
        WatchFilter::new(&inbox).with_pattern("*.csv").unwrap(),
    );
    let router = TriggerRouter::new(
        vec![ActiveTrigger {
            registration_id: "evt_ingest".to_string(),
            trigger,
        }],
        Duration::from_millis(500),
        Arc::clone(&queue),
    );

    let start = Instant::now();
    for i in 0..5u64 {
        let event = FsEvent::new(inbox.join("data.csv"), EventKind::Modify);
        router.handle_event(&event, start + Duration::from_millis(i * 50));
    }
    router.flush(start + Duration::from_millis(300));
    assert!(queue.is_empty());

    router.flush(start + Duration::from_secs(2));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.try_pop().unwrap().workflow_id, "ingest");
}

/// Fake docker CLI: logs every invocation, `run` sleeps until killed.
fn fake_docker(dir: &TempDir) -> (PathBuf, PathBuf) {
    let log = dir.path().join("docker.log");
    let script = dir.path().join("docker");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"$@\" >> '{}'\nif [ \"$1\" = run ]; then\nsleep 30\nfi\nexit 0\n",
            log.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

#[test]
fn test_cancelled_container_is_removed() {
    let dir = tempdir().unwrap();
    let (docker, log) = fake_docker(&dir);
    let mut config = Config::default();
    config.docker_enabled = true;
    config.docker_binary = Some(docker);

    let workflow = parse_workflow(
        "id: boxed\njobs:\n  build:\n    steps:\n      - run: make\n        image: alpine:3\n",
        None,
    )
    .unwrap();
    let mut engine = Engine::from_config(workflow, &config);
    engine.set_working_dir(dir.path());
    engine.set_output(Arc::new(OutputSink::silent()));
    let cancel = CancellationToken::new();
    engine.set_cancel_token(cancel.clone());

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
    });
    let report = engine.run().unwrap();

    assert!(!report.is_success());
    let calls = fs::read_to_string(&log).unwrap();
    let name = calls
        .lines()
        .find_map(|l| l.strip_prefix("run --name "))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap()
        .to_string();
    assert!(calls.contains("alpine:3"));
    assert!(calls.contains(&format!("rm -f {}", name)));
}

#[test]
fn test_sigterm_removes_container() {
    let dir = tempdir().unwrap();
    let (docker, log) = fake_docker(&dir);
    let config = dir.path().join("config.yaml");
    fs::write(&config, format!("docker_binary: {}\n", docker.display())).unwrap();
    let workflow = dir.path().join("boxed.yml");
    fs::write(
        &workflow,
        "id: boxed\njobs:\n  build:\n    steps:\n      - run: make\n        image: alpine:3\n",
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_localflow"))
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&workflow)
        .arg("--docker")
        .current_dir(dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !fs::read_to_string(&log).unwrap_or_default().contains("run --name")
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(20));
    }
    thread::sleep(Duration::from_millis(200));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "localflow did not exit after SIGTERM");
        thread::sleep(Duration::from_millis(20));
    };

    // Exited through the cancelled run, not killed by the signal.
    assert!(status.code().is_some());
    assert!(!status.success());

    let calls = fs::read_to_string(&log).unwrap();
    let name = calls
        .lines()
        .find_map(|l| l.strip_prefix("run --name "))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap()
        .to_string();
    assert!(calls.contains(&format!("rm -f {}", name)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daemon_runs_workflow_on_file_event() {
    let dir = tempdir().unwrap();
    let workflows = dir.path().join("workflows");
    let inbox = workflows.join("inbox");
    let marker = dir.path().join("ingested.txt");
    fs::create_dir_all(&inbox).unwrap();
    fs::write(
        workflows.join("ingest.yml"),
        format!(
            "id: ingest\njobs:\n  load:\n    steps:\n      - run: echo loaded >> {}\nevents:\n  - type: create\n    trigger:\n      paths: inbox\n      patterns: '*.csv'\n",
            marker.display()
        ),
    )
    .unwrap();

    let mut config = Config::default();
    config.workflows_dir = dir.path().join("global");
    config.local_workflows_dir = workflows;
    config.log_dir = dir.path().join("logs");
    config.monitor.debounce_ms = 50;
    config.output.mode = localflow::output::OutputMode::Stdout;

    let cancel = CancellationToken::new();
    let daemon = tokio::spawn(DaemonService::new(config).run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(500)).await;

    fs::write(inbox.join("batch.csv"), "a,b\n").unwrap();
    fs::write(inbox.join("notes.txt"), "ignored\n").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker.exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Allow a second (wrong) run to show up before checking.
    tokio::time::sleep(Duration::from_millis(300)).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(fs::read_to_string(&marker).unwrap(), "loaded\n");
}
