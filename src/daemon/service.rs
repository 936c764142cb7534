//! Daemon Service
//!
//! The long-lived daemon context. It owns the trigger queue, the file
//! watcher and the dispatcher, and rediscovers workflows every
//! `check_interval_secs` so new, changed or removed workflows (and events
//! enabled or disabled from the command line) take effect without a restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{
    ActiveTrigger, EventError, EventRegistry, EventWatcher, TriggerQueue, TriggerRouter,
};
use crate::workflow::WorkflowRegistry;

use super::dispatch::Dispatcher;
use super::DaemonError;

/// Serializes load-modify-save cycles on the event registry file.
///
/// The file is re-read on every update so changes made by other processes
/// (`events enable`, `events disable`) are never overwritten.
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the registry, applies `f` and saves the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut EventRegistry) -> R) -> Result<R, EventError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut registry = EventRegistry::load(&self.path)?;
        let result = f(&mut registry);
        registry.save()?;
        Ok(result)
    }

    /// Loads the registry for reading.
    pub fn read<R>(&self, f: impl FnOnce(&EventRegistry) -> R) -> Result<R, EventError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let registry = EventRegistry::load(&self.path)?;
        Ok(f(&registry))
    }
}

pub struct DaemonService {
    config: Config,
    queue: Arc<TriggerQueue>,
    store: Arc<RegistryStore>,
    workflows: watch::Sender<Arc<WorkflowRegistry>>,
    watcher: Option<EventWatcher>,
    router: Option<Arc<TriggerRouter>>,
    active: Vec<ActiveTrigger>,
}

impl DaemonService {
    pub fn new(config: Config) -> Self {
        let queue = Arc::new(TriggerQueue::new(config.monitor.queue_capacity));
        let store = Arc::new(RegistryStore::new(config.events_file()));
        let (workflows, _) = watch::channel(Arc::new(WorkflowRegistry::new()));
        Self {
            config,
            queue,
            store,
            workflows,
            watcher: None,
            router: None,
            active: Vec::new(),
        }
    }

    pub fn queue(&self) -> Arc<TriggerQueue> {
        Arc::clone(&self.queue)
    }

    pub fn store(&self) -> Arc<RegistryStore> {
        Arc::clone(&self.store)
    }

    /// Workflows found by the last refresh.
    pub fn workflows(&self) -> Arc<WorkflowRegistry> {
        self.workflows.borrow().clone()
    }

    /// Triggers the watcher is currently serving.
    pub fn active_triggers(&self) -> &[ActiveTrigger] {
        &self.active
    }

    /// Roots the watcher is currently watching.
    pub fn watched(&self) -> &[PathBuf] {
        self.watcher.as_ref().map(EventWatcher::watched).unwrap_or(&[])
    }

    /// Rediscovers workflows, syncs the event registry and rebuilds the
    /// watcher when the set of enabled triggers changed.
    ///
    /// Errors are logged; the previous watcher stays in place.
    pub fn refresh(&mut self) {
        let registry = Arc::new(WorkflowRegistry::discover(&self.config.workflow_dirs()));
        self.workflows.send_replace(Arc::clone(&registry));

        let synced = self.store.update(|events| {
            let summary = events.sync(&registry);
            (summary, events.active_triggers(&registry))
        });
        let active = match synced {
            Ok((summary, active)) => {
                if summary.changed() {
                    info!(
                        "Event registry updated: {} added, {} removed",
                        summary.added.len(),
                        summary.removed.len()
                    );
                }
                active
            }
            Err(e) => {
                error!("Cannot sync event registry: {}", e);
                return;
            }
        };

        if active == self.active && (self.watcher.is_some() || active.is_empty()) {
            debug!("Event triggers unchanged ({} active)", active.len());
            return;
        }
        self.rebuild_watcher(active);
    }

    fn rebuild_watcher(&mut self, active: Vec<ActiveTrigger>) {
        self.stop_watcher();

        if active.is_empty() {
            info!("No enabled event triggers");
            self.active = active;
            return;
        }

        let router = Arc::new(TriggerRouter::new(
            active.clone(),
            Duration::from_millis(self.config.monitor.debounce_ms),
            Arc::clone(&self.queue),
        ));
        match EventWatcher::start(Arc::clone(&router), self.pump_tick()) {
            Ok(watcher) => {
                info!(
                    "Watching {} paths for {} event triggers",
                    watcher.watched().len(),
                    active.len()
                );
                self.watcher = Some(watcher);
                self.router = Some(router);
                self.active = active;
            }
            Err(e) => {
                // Left empty so the next refresh retries.
                error!("Cannot start file watcher: {}", e);
                self.active = Vec::new();
            }
        }
    }

    /// Stops the watcher and hands its pending debounced requests to the queue.
    fn stop_watcher(&mut self) {
        self.watcher = None;
        if let Some(router) = self.router.take() {
            let flushed = router.flush_all();
            if flushed > 0 {
                debug!("Flushed {} pending triggers", flushed);
            }
        }
    }

    fn pump_tick(&self) -> Duration {
        Duration::from_millis((self.config.monitor.debounce_ms / 5).clamp(20, 100))
    }

    /// Runs until `cancel` fires, then stops the watcher, closes the queue
    /// and waits for in-flight runs (which are cancelled too).
    ///
    /// Refreshing blocks in place, so this needs a multi-thread runtime; on
    /// a current-thread runtime it returns an error without starting.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), DaemonError> {
        if Handle::current().runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(DaemonError::Runtime(std::io::Error::other(
                "daemon service needs a multi-thread runtime",
            )));
        }

        info!(
            "Daemon service started (check interval {}s, max {} concurrent runs)",
            self.config.monitor.check_interval_secs, self.config.monitor.max_concurrent_runs
        );

        let dispatcher = Dispatcher::new(
            self.config.clone(),
            Arc::clone(&self.queue),
            self.workflows.subscribe(),
            Arc::clone(&self.store),
        );
        let dispatch = tokio::spawn(dispatcher.run(cancel.child_token()));

        let period = Duration::from_secs(self.config.monitor.check_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tokio::task::block_in_place(|| self.refresh()),
            }
        }

        info!("Daemon service shutting down");
        tokio::task::block_in_place(|| self.stop_watcher());
        self.queue.close();
        if let Err(e) = dispatch.await {
            warn!("Dispatcher ended abnormally: {}", e);
        }
        info!("Daemon service stopped");
        Ok(())
    }
}
