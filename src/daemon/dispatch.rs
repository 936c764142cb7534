//! Run Dispatcher
//!
//! Consumes the trigger queue and runs each request through the engine on a
//! blocking worker. At most `max_concurrent_runs` runs are in flight; with the
//! default of 1 triggered runs are serialized.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::WorkflowResult;
use crate::events::{RunRequest, TriggerQueue};
use crate::execution::{Engine, RunReport};
use crate::output::OutputSink;
use crate::workflow::{Workflow, WorkflowRegistry};

use super::service::RegistryStore;

pub struct Dispatcher {
    config: Arc<Config>,
    queue: Arc<TriggerQueue>,
    workflows: watch::Receiver<Arc<WorkflowRegistry>>,
    store: Arc<RegistryStore>,
    limit: Arc<Semaphore>,
    max: usize,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        queue: Arc<TriggerQueue>,
        workflows: watch::Receiver<Arc<WorkflowRegistry>>,
        store: Arc<RegistryStore>,
    ) -> Self {
        let max = config.monitor.max_concurrent_runs.max(1);
        Self {
            config: Arc::new(config),
            queue,
            workflows,
            store,
            limit: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Dispatches requests until the queue closes or `cancel` fires, then
    /// waits for the runs still in flight. Cancelling also aborts their steps.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.queue.pop() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let workflows = self.workflows.borrow().clone();
            let config = Arc::clone(&self.config);
            let store = Arc::clone(&self.store);
            let run_cancel = cancel.child_token();
            tokio::spawn(async move {
                dispatch(config, store, workflows, request, run_cancel).await;
                drop(permit);
            });
        }

        debug!("Dispatcher waiting for in-flight runs");
        if self.limit.acquire_many(self.max as u32).await.is_err() {
            warn!("Dispatcher semaphore closed while waiting for runs");
        }
        debug!("Dispatcher stopped");
    }
}

async fn dispatch(
    config: Arc<Config>,
    store: Arc<RegistryStore>,
    workflows: Arc<WorkflowRegistry>,
    request: RunRequest,
    cancel: CancellationToken,
) {
    info!(
        "Dispatching workflow '{}' ({} on {}, queued {:?} ago)",
        request.workflow_id,
        request.kind,
        request.path.display(),
        request.enqueued_at.elapsed()
    );

    let registration = request.registration_id.clone();
    let now = Utc::now();
    let recorded = tokio::task::spawn_blocking(move || {
        store.update(|events| events.record_trigger(&registration, now))
    })
    .await;
    match recorded {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) | Ok(Err(e)) => warn!("Cannot record trigger time: {}", e),
        Err(e) => warn!("Recording trigger time panicked: {}", e),
    }

    let workflow = match workflows.get(&request.workflow_id) {
        Some(workflow) => workflow.clone(),
        None => {
            warn!(
                "Triggered workflow '{}' is no longer available",
                request.workflow_id
            );
            return;
        }
    };

    let workflow_id = request.workflow_id.clone();
    let jobs = request.job_ids.clone();
    let result =
        tokio::task::spawn_blocking(move || execute(&config, workflow, &jobs, cancel)).await;
    match result {
        Ok(Ok(report)) if report.is_success() => info!(
            "Triggered run of '{}' succeeded in {} ms",
            workflow_id,
            report.duration_ms()
        ),
        Ok(Ok(report)) => warn!(
            "Triggered run of '{}' finished with {} failed jobs",
            workflow_id,
            report.failed_jobs().len()
        ),
        Ok(Err(e)) => error!("Triggered run of '{}' failed: {}", workflow_id, e),
        Err(e) => error!("Triggered run of '{}' panicked: {}", workflow_id, e),
    }
}

/// Runs `jobs` of `workflow` (all jobs when empty) with the daemon's settings.
///
/// Step output goes to the configured output overlaid with the workflow's
/// own output section; if that cannot be opened it goes to stdout.
pub fn execute(
    config: &Config,
    workflow: Workflow,
    jobs: &[String],
    cancel: CancellationToken,
) -> WorkflowResult<RunReport> {
    let output = match &workflow.output {
        Some(own) => config.output.overlay(own),
        None => config.output.clone(),
    };
    let sink = OutputSink::open(&output).unwrap_or_else(|e| {
        warn!("Cannot open run output ({}), using stdout", e);
        OutputSink::stdout()
    });

    let mut engine = Engine::from_config(workflow, config);
    engine.set_cancel_token(cancel);
    engine.set_output(Arc::new(sink));
    engine.run_jobs(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::output::{OutputConfig, OutputMode};
    use crate::workflow::{parse_workflow, WorkflowOrigin};
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn setup(root: &Path, yaml: &str, max: usize) -> (Dispatcher, Arc<TriggerQueue>) {
        let mut config = Config::default();
        config.log_dir = root.join("logs");
        config.monitor.max_concurrent_runs = max;
        config.output = OutputConfig {
            file: Some(root.join("logs").join("runs.log")),
            mode: OutputMode::File,
            stdout: false,
            append: true,
        };

        let mut registry = WorkflowRegistry::new();
        registry.insert(parse_workflow(yaml, None).unwrap(), WorkflowOrigin::Local);
        let (_tx, rx) = watch::channel(Arc::new(registry));

        let queue = Arc::new(TriggerQueue::new(16));
        let store = Arc::new(RegistryStore::new(config.events_file()));
        (
            Dispatcher::new(config, Arc::clone(&queue), rx, store),
            queue,
        )
    }

    fn request(workflow: &str, jobs: &[&str]) -> RunRequest {
        RunRequest::new(
            workflow,
            jobs.iter().map(|j| j.to_string()).collect(),
            "/tmp/inbox/a.csv",
            EventKind::Create,
            "evt_test",
        )
    }

    #[tokio::test]
    async fn test_runs_requested_jobs() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker.txt");
        let yaml = format!(
            "id: ingest\njobs:\n  load:\n    steps:\n      - run: echo load >> {m}\n  report:\n    steps:\n      - run: echo report >> {m}\n",
            m = marker.display()
        );
        let (dispatcher, queue) = setup(dir.path(), &yaml, 1);

        queue.push(request("missing", &[]));
        queue.push(request("ingest", &["load"]));
        queue.close();
        dispatcher.run(CancellationToken::new()).await;

        assert_eq!(fs::read_to_string(&marker).unwrap(), "load\n");
        let log = fs::read_to_string(dir.path().join("logs").join("runs.log")).unwrap();
        assert!(log.contains("==> [load]"));
    }

    #[tokio::test]
    async fn test_runs_are_serialized_by_default() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("order.txt");
        let yaml = format!(
            "id: slow\njobs:\n  work:\n    steps:\n      - run: echo start >> {m}; sleep 0.2; echo end >> {m}\n",
            m = marker.display()
        );
        let (dispatcher, queue) = setup(dir.path(), &yaml, 1);

        queue.push(request("slow", &[]));
        queue.push(request("slow", &["work"]));
        queue.close();
        dispatcher.run(CancellationToken::new()).await;

        assert_eq!(
            fs::read_to_string(&marker).unwrap(),
            "start\nend\nstart\nend\n"
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_run() {
        let dir = tempdir().unwrap();
        let yaml = "id: hang\njobs:\n  wait:\n    steps:\n      - run: sleep 30\n";
        let (dispatcher, queue) = setup(dir.path(), yaml, 1);
        let cancel = CancellationToken::new();

        queue.push(request("hang", &[]));
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_execute_uses_workflow_output() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("own.log");
        let yaml = format!(
            "id: out\noutput:\n  file: {}\n  mode: file\njobs:\n  a:\n    steps:\n      - run: echo hello\n",
            out.display()
        );
        let workflow = parse_workflow(&yaml, None).unwrap();

        let report = execute(&Config::default(), workflow, &[], CancellationToken::new()).unwrap();
        assert!(report.is_success());
        assert!(fs::read_to_string(&out).unwrap().contains("hello"));
    }
}
