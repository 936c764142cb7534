//! Event Triggers
//!
//! Binds a file-system event kind and a [`WatchFilter`] to a workflow (or a
//! subset of its jobs).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::filter::{FileFacts, WatchFilter, WatchFilterSpec};
use super::EventError;

/// Kind of file-system change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[serde(alias = "file_create", alias = "created")]
    Create,
    #[serde(alias = "file_change", alias = "file_modify", alias = "modified")]
    Modify,
    #[serde(alias = "file_delete", alias = "deleted")]
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed file-system change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: EventKind,
    pub facts: Option<FileFacts>,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: EventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            facts: None,
        }
    }

    /// Builds an event and reads the file metadata (not for deletions).
    pub fn observe(path: impl Into<PathBuf>, kind: EventKind) -> Self {
        let path = path.into();
        let facts = match kind {
            EventKind::Delete => None,
            _ => FileFacts::read(&path),
        };
        Self { path, kind, facts }
    }
}

/// A compiled event trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTrigger {
    pub kind: EventKind,
    /// Workflow to run
    pub workflow_id: String,
    /// Jobs to run; empty means the whole workflow
    pub job_ids: Vec<String>,
    pub filter: WatchFilter,
}

impl EventTrigger {
    pub fn new(kind: EventKind, workflow_id: impl Into<String>, filter: WatchFilter) -> Self {
        Self {
            kind,
            workflow_id: workflow_id.into(),
            job_ids: Vec::new(),
            filter,
        }
    }

    pub fn with_jobs<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_ids = jobs.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, event: &FsEvent) -> bool {
        self.kind == event.kind && self.filter.matches(&event.path, event.facts.as_ref())
    }
}

/// Raw entry of a workflow's `events:` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventTriggerSpec {
    #[serde(rename = "type", alias = "kind")]
    pub kind: EventKind,
    pub workflow_id: Option<String>,
    #[serde(
        default,
        alias = "job_ids",
        deserialize_with = "crate::workflow::parser::one_or_many"
    )]
    pub jobs: Vec<String>,
    pub trigger: WatchFilterSpec,
}

impl EventTriggerSpec {
    /// Compiles the trigger; the target defaults to the defining workflow.
    pub fn compile(
        self,
        defining_workflow: &str,
        base_dir: Option<&Path>,
    ) -> Result<EventTrigger, EventError> {
        Ok(EventTrigger {
            kind: self.kind,
            workflow_id: self
                .workflow_id
                .unwrap_or_else(|| defining_workflow.to_string()),
            job_ids: self.jobs,
            filter: WatchFilter::from_spec(self.trigger, base_dir)?,
        })
    }
}
