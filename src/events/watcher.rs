//! File-System Watching
//!
//! [`TriggerRouter`] is the synchronous core: it matches events against the
//! active triggers, debounces them per (registration, path) and flushes quiet
//! requests into the [`TriggerQueue`]. [`EventWatcher`] feeds it from a
//! `notify` watcher and runs the flush pump on its own thread.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use super::debounce::Debouncer;
use super::queue::{PushOutcome, TriggerQueue};
use super::trigger::{EventKind, EventTrigger, FsEvent};
use super::{EventError, RunRequest};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// An enabled trigger together with its registration id.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTrigger {
    pub registration_id: String,
    pub trigger: EventTrigger,
}

type DebounceKey = (String, PathBuf);

/// Matches events, debounces them and feeds the queue.
#[derive(Debug)]
pub struct TriggerRouter {
    triggers: Vec<ActiveTrigger>,
    debouncer: Mutex<Debouncer<DebounceKey, RunRequest>>,
    queue: Arc<TriggerQueue>,
}

impl TriggerRouter {
    pub fn new(triggers: Vec<ActiveTrigger>, window: Duration, queue: Arc<TriggerQueue>) -> Self {
        Self {
            triggers,
            debouncer: Mutex::new(Debouncer::new(window)),
            queue,
        }
    }

    fn debouncer(&self) -> MutexGuard<'_, Debouncer<DebounceKey, RunRequest>> {
        self.debouncer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a debounced request for every trigger the event matches.
    /// Returns the number of matching triggers.
    pub fn handle_event(&self, event: &FsEvent, now: Instant) -> usize {
        let mut matched = 0;
        let mut debouncer = self.debouncer();

        for active in &self.triggers {
            if !active.trigger.matches(event) {
                continue;
            }
            matched += 1;
            debug!(
                "Event {} on {} matched registration {}",
                event.kind,
                event.path.display(),
                active.registration_id
            );

            let mut request = RunRequest::new(
                active.trigger.workflow_id.clone(),
                active.trigger.job_ids.clone(),
                event.path.clone(),
                event.kind,
                active.registration_id.clone(),
            );
            request.enqueued_at = now;
            debouncer.observe(
                (active.registration_id.clone(), event.path.clone()),
                request,
                now,
            );
        }

        matched
    }

    /// Moves requests whose burst ended into the queue.
    pub fn flush(&self, now: Instant) -> usize {
        let ready = self.debouncer().drain_ready(now);
        self.enqueue(ready)
    }

    /// Moves every pending request into the queue.
    pub fn flush_all(&self) -> usize {
        let ready = self.debouncer().drain_all();
        self.enqueue(ready)
    }

    pub fn pending(&self) -> usize {
        self.debouncer().len()
    }

    fn enqueue(&self, requests: Vec<RunRequest>) -> usize {
        let mut queued = 0;
        for request in requests {
            info!(
                "Triggering workflow '{}' ({} on {})",
                request.workflow_id,
                request.kind,
                request.path.display()
            );
            match self.queue.push(request) {
                PushOutcome::Closed => warn!("Trigger queue closed, request discarded"),
                _ => queued += 1,
            }
        }
        queued
    }

    /// Roots to watch; a root is watched recursively if any trigger on it is.
    pub fn watch_roots(&self) -> Vec<(PathBuf, RecursiveMode)> {
        let mut roots: BTreeMap<PathBuf, bool> = BTreeMap::new();
        for active in &self.triggers {
            let filter = &active.trigger.filter;
            for path in &filter.paths {
                let recursive = roots.entry(path.clone()).or_insert(false);
                *recursive |= filter.recursive;
            }
        }
        roots
            .into_iter()
            .map(|(path, recursive)| {
                let mode = if recursive {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                (path, mode)
            })
            .collect()
    }
}

/// Maps a notify event kind onto the kinds triggers understand.
pub fn map_event_kind(kind: &notify::EventKind) -> Option<EventKind> {
    match kind {
        notify::EventKind::Create(_) => Some(EventKind::Create),
        notify::EventKind::Remove(_) => Some(EventKind::Delete),
        notify::EventKind::Modify(ModifyKind::Metadata(_)) => None,
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(EventKind::Create),
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(EventKind::Delete),
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
        notify::EventKind::Modify(_) => Some(EventKind::Modify),
        _ => None,
    }
}

/// Splits a notify event into per-path trigger events.
///
/// A rename reported with both names becomes a delete of the old path and a
/// create of the new one.
pub fn translate_event(event: notify::Event) -> Vec<(EventKind, PathBuf)> {
    if let notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        let mut paths = event.paths.into_iter();
        let mut translated = Vec::with_capacity(2);
        if let Some(from) = paths.next() {
            translated.push((EventKind::Delete, from));
        }
        if let Some(to) = paths.next() {
            translated.push((EventKind::Create, to));
        }
        return translated;
    }

    match map_event_kind(&event.kind) {
        Some(kind) => event.paths.into_iter().map(|path| (kind, path)).collect(),
        None => Vec::new(),
    }
}

/// Running watcher plus the debounce pump thread.
pub struct EventWatcher {
    _watcher: RecommendedWatcher,
    pump: Option<JoinHandle<()>>,
    stop: CancellationToken,
    watched: Vec<PathBuf>,
}

impl EventWatcher {
    /// Starts watching every root used by the router's triggers.
    ///
    /// Roots that cannot be watched are logged and skipped.
    pub fn start(router: Arc<TriggerRouter>, tick: Duration) -> Result<Self, EventError> {
        let handler_router = Arc::clone(&router);
        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    for (kind, path) in translate_event(event) {
                        if kind != EventKind::Delete && path.is_dir() {
                            continue;
                        }
                        let fs_event = FsEvent::observe(path, kind);
                        handler_router.handle_event(&fs_event, Instant::now());
                    }
                }
                Err(e) => warn!("File watch error: {}", e),
            },
        )
        .map_err(|source| EventError::Watch {
            path: PathBuf::new(),
            source,
        })?;

        let mut watched = Vec::new();
        for (root, mode) in router.watch_roots() {
            if !root.exists() {
                warn!("Watch path {} does not exist, skipping", root.display());
                continue;
            }
            match watcher.watch(&root, mode) {
                Ok(()) => {
                    info!("Watching {} ({:?})", root.display(), mode);
                    watched.push(root);
                }
                Err(e) => warn!("Failed to watch {}: {}", root.display(), e),
            }
        }

        let stop = CancellationToken::new();
        let pump_stop = stop.clone();
        let pump = thread::spawn(move || {
            while !pump_stop.is_cancelled() {
                thread::sleep(tick);
                router.flush(Instant::now());
            }
        });

        Ok(Self {
            _watcher: watcher,
            pump: Some(pump),
            stop,
            watched,
        })
    }

    /// Roots actually being watched.
    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!("Debounce pump thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::filter::WatchFilter;
    use tempfile::tempdir;

    fn router(window: Duration, queue: Arc<TriggerQueue>) -> TriggerRouter {
        let trigger = EventTrigger::new(
            EventKind::Create,
            "wf",
            WatchFilter::new("/inbox").with_pattern("*.csv").unwrap(),
        );
        TriggerRouter::new(
            vec![ActiveTrigger {
                registration_id: "evt_1".to_string(),
                trigger,
            }],
            window,
            queue,
        )
    }

    #[test]
    fn test_burst_produces_single_request() {
        let queue = Arc::new(TriggerQueue::new(16));
        let router = router(Duration::from_millis(500), Arc::clone(&queue));
        let start = Instant::now();

        for i in 0..5u64 {
            let event = FsEvent::new("/inbox/a.csv", EventKind::Create);
            assert_eq!(router.handle_event(&event, start + Duration::from_millis(i * 10)), 1);
        }

        assert_eq!(router.flush(start + Duration::from_millis(100)), 0);
        assert_eq!(router.flush(start + Duration::from_secs(1)), 1);
        assert_eq!(queue.len(), 1);

        let request = queue.try_pop().unwrap();
        assert_eq!(request.workflow_id, "wf");
        assert_eq!(request.registration_id, "evt_1");
    }

    #[test]
    fn test_distinct_paths_debounce_separately() {
        let queue = Arc::new(TriggerQueue::new(16));
        let router = router(Duration::from_millis(50), Arc::clone(&queue));
        let now = Instant::now();

        router.handle_event(&FsEvent::new("/inbox/a.csv", EventKind::Create), now);
        router.handle_event(&FsEvent::new("/inbox/b.csv", EventKind::Create), now);
        router.handle_event(&FsEvent::new("/inbox/c.txt", EventKind::Create), now);

        assert_eq!(router.pending(), 2);
        assert_eq!(router.flush_all(), 2);
    }

    #[test]
    fn test_watch_roots_merge_recursion() {
        let queue = Arc::new(TriggerQueue::new(4));
        let flat = EventTrigger::new(EventKind::Create, "a", WatchFilter::new("/data"));
        let deep = EventTrigger::new(
            EventKind::Modify,
            "b",
            WatchFilter::new("/data").recursive(None),
        );
        let router = TriggerRouter::new(
            vec![
                ActiveTrigger {
                    registration_id: "1".into(),
                    trigger: flat,
                },
                ActiveTrigger {
                    registration_id: "2".into(),
                    trigger: deep,
                },
            ],
            Duration::from_millis(10),
            queue,
        );

        assert_eq!(
            router.watch_roots(),
            vec![(PathBuf::from("/data"), RecursiveMode::Recursive)]
        );
    }

    #[test]
    fn test_map_event_kind() {
        use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

        assert_eq!(
            map_event_kind(&notify::EventKind::Create(CreateKind::File)),
            Some(EventKind::Create)
        );
        assert_eq!(
            map_event_kind(&notify::EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(EventKind::Modify)
        );
        assert_eq!(
            map_event_kind(&notify::EventKind::Remove(RemoveKind::File)),
            Some(EventKind::Delete)
        );
        assert_eq!(
            map_event_kind(&notify::EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::Permissions
            ))),
            None
        );
    }

    #[test]
    fn test_rename_splits_into_delete_and_create() {
        let event = notify::Event::new(notify::EventKind::Modify(ModifyKind::Name(
            RenameMode::Both,
        )))
        .add_path(PathBuf::from("/inbox/old.csv"))
        .add_path(PathBuf::from("/inbox/new.csv"));

        assert_eq!(
            translate_event(event),
            vec![
                (EventKind::Delete, PathBuf::from("/inbox/old.csv")),
                (EventKind::Create, PathBuf::from("/inbox/new.csv")),
            ]
        );

        let moved_in = notify::Event::new(notify::EventKind::Modify(ModifyKind::Name(
            RenameMode::To,
        )))
        .add_path(PathBuf::from("/inbox/new.csv"));
        assert_eq!(
            translate_event(moved_in),
            vec![(EventKind::Create, PathBuf::from("/inbox/new.csv"))]
        );
    }

    #[test]
    fn test_watcher_delivers_real_events() {
        let dir = tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let queue = Arc::new(TriggerQueue::new(16));
        let trigger = EventTrigger::new(
            EventKind::Create,
            "wf",
            WatchFilter::new(&root).with_pattern("*.csv").unwrap(),
        );
        let router = Arc::new(TriggerRouter::new(
            vec![ActiveTrigger {
                registration_id: "evt_live".into(),
                trigger,
            }],
            Duration::from_millis(50),
            Arc::clone(&queue),
        ));

        let watcher = EventWatcher::start(router, Duration::from_millis(20)).unwrap();
        assert_eq!(watcher.watched(), &[root.clone()]);

        std::fs::write(root.join("data.csv"), "a,b\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        drop(watcher);

        let request = queue.try_pop().expect("watcher should enqueue a request");
        assert_eq!(request.path, root.join("data.csv"));
        assert_eq!(request.kind, EventKind::Create);
    }
}
