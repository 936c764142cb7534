//! Event Registry
//!
//! Persists one registration per workflow event so triggers can be enabled,
//! disabled and inspected across daemon restarts.
//!
//! Registrations are saved to `<log_dir>/events.json` after every change.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::workflow::{generate_id, WorkflowOrigin, WorkflowRegistry};

use super::trigger::EventKind;
use super::watcher::ActiveTrigger;
use super::EventError;

/// Deterministic id for the `index`th event of a workflow.
pub fn registration_id(workflow_id: &str, kind: EventKind, index: usize) -> String {
    generate_id("evt", &format!("{}_{}_{}", workflow_id, kind, index))
}

/// A workflow event known to the daemon.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventRegistration {
    pub id: String,

    /// Workflow that declares the event
    pub workflow_id: String,

    /// Workflow the event runs
    pub target_workflow: String,

    pub kind: EventKind,

    /// Position in the declaring workflow's `events` list
    pub index: usize,

    /// Jobs to run; empty means the whole workflow
    pub job_ids: Vec<String>,

    /// Watched paths, for display
    pub paths: Vec<PathBuf>,

    pub source: WorkflowOrigin,

    pub enabled: bool,

    pub registered_at: DateTime<Utc>,

    pub last_triggered: Option<DateTime<Utc>>,
}

/// Selection applied by [`EventRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct RegistrationFilter {
    /// Declaring or target workflow id
    pub workflow: Option<String>,
    pub enabled_only: bool,
}

impl RegistrationFilter {
    fn accepts(&self, registration: &EventRegistration) -> bool {
        if self.enabled_only && !registration.enabled {
            return false;
        }
        match &self.workflow {
            Some(w) => registration.workflow_id == *w || registration.target_workflow == *w,
            None => true,
        }
    }
}

/// Result of [`EventRegistry::sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SyncSummary {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    registrations: Vec<EventRegistration>,
}

#[derive(Debug)]
pub struct EventRegistry {
    path: PathBuf,
    registrations: BTreeMap<String, EventRegistration>,
}

impl EventRegistry {
    /// Empty registry that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            registrations: BTreeMap::new(),
        }
    }

    /// Loads the registry; a missing file yields an empty registry.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EventError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No event registry at {}, starting empty", path.display());
            return Ok(Self::new(path));
        }

        let content = fs::read_to_string(path).map_err(|source| EventError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: RegistryFile =
            serde_json::from_str(&content).map_err(|source| EventError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(
            "Loaded {} event registrations from {}",
            file.registrations.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            registrations: file
                .registrations
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
        })
    }

    /// Writes the registry as pretty JSON, replacing the file atomically.
    pub fn save(&self) -> Result<(), EventError> {
        let io_error = |source| EventError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }

        let file = RegistryFile {
            registrations: self.registrations.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|source| EventError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_error)?;
        fs::rename(&tmp, &self.path).map_err(io_error)?;

        debug!("Saved event registry to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers every workflow event not yet known and drops registrations
    /// whose event disappeared. Enable flags and timestamps are kept.
    pub fn sync(&mut self, workflows: &WorkflowRegistry) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut seen = BTreeSet::new();

        for entry in workflows.list() {
            let workflow = &entry.workflow;
            for (index, trigger) in workflow.events.iter().enumerate() {
                let id = registration_id(&workflow.id, trigger.kind, index);
                seen.insert(id.clone());

                match self.registrations.get_mut(&id) {
                    Some(existing) => {
                        existing.target_workflow = trigger.workflow_id.clone();
                        existing.job_ids = trigger.job_ids.clone();
                        existing.paths = trigger.filter.paths.clone();
                        existing.source = entry.origin;
                    }
                    None => {
                        info!(
                            "Registered {} event {} for workflow '{}'",
                            trigger.kind, id, workflow.id
                        );
                        self.registrations.insert(
                            id.clone(),
                            EventRegistration {
                                id: id.clone(),
                                workflow_id: workflow.id.clone(),
                                target_workflow: trigger.workflow_id.clone(),
                                kind: trigger.kind,
                                index,
                                job_ids: trigger.job_ids.clone(),
                                paths: trigger.filter.paths.clone(),
                                source: entry.origin,
                                enabled: true,
                                registered_at: Utc::now(),
                                last_triggered: None,
                            },
                        );
                        summary.added.push(id);
                    }
                }
            }
        }

        let stale: Vec<String> = self
            .registrations
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            info!("Unregistered event {}", id);
            self.registrations.remove(&id);
            summary.removed.push(id);
        }

        summary
    }

    pub fn get(&self, id: &str) -> Option<&EventRegistration> {
        self.registrations.get(id)
    }

    pub fn enable(&mut self, id: &str) -> Result<&EventRegistration, EventError> {
        self.set_enabled(id, true)
    }

    pub fn disable(&mut self, id: &str) -> Result<&EventRegistration, EventError> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<&EventRegistration, EventError> {
        let registration = self
            .registrations
            .get_mut(id)
            .ok_or_else(|| EventError::RegistrationNotFound(id.to_string()))?;
        registration.enabled = enabled;
        info!(
            "Event {} {}",
            id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(registration)
    }

    /// Registrations matching `filter`, sorted by workflow then position.
    pub fn list(&self, filter: &RegistrationFilter) -> Vec<&EventRegistration> {
        let mut out: Vec<&EventRegistration> = self
            .registrations
            .values()
            .filter(|r| filter.accepts(r))
            .collect();
        out.sort_by(|a, b| {
            a.workflow_id
                .cmp(&b.workflow_id)
                .then(a.index.cmp(&b.index))
        });
        out
    }

    pub fn record_trigger(&mut self, id: &str, at: DateTime<Utc>) -> Result<(), EventError> {
        let registration = self
            .registrations
            .get_mut(id)
            .ok_or_else(|| EventError::RegistrationNotFound(id.to_string()))?;
        registration.last_triggered = Some(at);
        Ok(())
    }

    /// Compiled triggers of every enabled registration.
    pub fn active_triggers(&self, workflows: &WorkflowRegistry) -> Vec<ActiveTrigger> {
        let mut active = Vec::new();
        for registration in self.list(&RegistrationFilter {
            workflow: None,
            enabled_only: true,
        }) {
            let trigger = workflows
                .get(&registration.workflow_id)
                .and_then(|w| w.events.get(registration.index));
            match trigger {
                Some(trigger) => active.push(ActiveTrigger {
                    registration_id: registration.id.clone(),
                    trigger: trigger.clone(),
                }),
                None => warn!(
                    "Event {} refers to a missing workflow event ({}#{})",
                    registration.id, registration.workflow_id, registration.index
                ),
            }
        }
        active
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
