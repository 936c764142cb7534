//! Workflow Registry
//!
//! Discovers workflow files (`*.yml`, `*.yaml`) in the configured
//! directories and indexes them by id. Files that fail to load are logged and
//! skipped so one broken workflow does not hide the others.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};

use super::model::Workflow;
use super::parser::load_workflow;

/// Directory a workflow was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowOrigin {
    /// User-wide directory
    Global,
    /// Project directory
    Local,
}

impl fmt::Display for WorkflowOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// A discovered workflow.
#[derive(Debug, Clone)]
pub struct WorkflowEntry {
    pub workflow: Workflow,
    pub origin: WorkflowOrigin,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    entries: BTreeMap<String, WorkflowEntry>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans every directory in order; later directories override earlier
    /// ones on id collisions.
    pub fn discover(dirs: &[(PathBuf, WorkflowOrigin)]) -> Self {
        let mut registry = Self::new();
        for (dir, origin) in dirs {
            registry.scan_dir(dir, *origin);
        }
        info!("Discovered {} workflows", registry.len());
        registry
    }

    /// Loads every workflow file directly inside `dir`. Returns the number
    /// of workflows loaded.
    pub fn scan_dir(&mut self, dir: &Path, origin: WorkflowOrigin) -> usize {
        if !dir.is_dir() {
            debug!("Workflow directory {} does not exist", dir.display());
            return 0;
        }

        let mut loaded = 0;
        for path in workflow_files(dir) {
            match load_workflow(&path) {
                Ok(workflow) => {
                    debug!("Loaded workflow '{}' from {}", workflow.id, path.display());
                    self.insert(workflow, origin);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping invalid workflow {}: {}", path.display(), e),
            }
        }
        loaded
    }

    pub fn insert(&mut self, workflow: Workflow, origin: WorkflowOrigin) {
        if let Some(previous) = self.entries.get(&workflow.id) {
            info!(
                "Workflow '{}' from {} overrides the {} definition",
                workflow.id, origin, previous.origin
            );
        }
        self.entries
            .insert(workflow.id.clone(), WorkflowEntry { workflow, origin });
    }

    /// Looks a workflow up by id, then by name, then by file stem. Names
    /// compare case-insensitively with spaces read as underscores.
    pub fn get(&self, id_or_name: &str) -> Option<&Workflow> {
        self.entry(id_or_name).map(|e| &e.workflow)
    }

    pub fn entry(&self, id_or_name: &str) -> Option<&WorkflowEntry> {
        if let Some(entry) = self.entries.get(id_or_name) {
            return Some(entry);
        }
        let wanted = normalize_name(id_or_name);
        self.entries
            .values()
            .find(|e| normalize_name(&e.workflow.name) == wanted)
            .or_else(|| {
                self.entries.values().find(|e| {
                    e.workflow
                        .source
                        .as_deref()
                        .and_then(Path::file_stem)
                        .map(|stem| stem.to_string_lossy() == id_or_name)
                        .unwrap_or(false)
                })
            })
    }

    /// Like [`get`](Self::get) but reports a missing workflow as an error.
    pub fn require(&self, id_or_name: &str) -> WorkflowResult<&Workflow> {
        self.get(id_or_name)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(id_or_name.to_string()))
    }

    pub fn origin(&self, id: &str) -> Option<WorkflowOrigin> {
        self.entries.get(id).map(|e| e.origin)
    }

    /// All workflows sorted by name.
    pub fn list(&self) -> Vec<&WorkflowEntry> {
        let mut entries: Vec<&WorkflowEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            a.workflow
                .name
                .cmp(&b.workflow.name)
                .then_with(|| a.workflow.id.cmp(&b.workflow.id))
        });
        entries
    }

    /// Workflows carrying every one of `tags`.
    pub fn find_by_tags(&self, tags: &[String]) -> Vec<&WorkflowEntry> {
        self.list()
            .into_iter()
            .filter(|e| tags.iter().all(|t| e.workflow.has_tag(t)))
            .collect()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// `*.yml` and `*.yaml` files directly inside `dir`, sorted by path.
fn workflow_files(dir: &Path) -> Vec<PathBuf> {
    let base = glob::Pattern::escape(&dir.to_string_lossy());
    let mut files = Vec::new();

    for extension in ["yml", "yaml"] {
        let pattern = format!("{}/*.{}", base, extension);
        match glob::glob(&pattern) {
            Ok(paths) => files.extend(paths.filter_map(|entry| match entry {
                Ok(path) if path.is_file() => Some(path),
                Ok(_) => None,
                Err(e) => {
                    warn!("Cannot read {}: {}", e.path().display(), e.error());
                    None
                }
            })),
            Err(e) => warn!("Bad workflow pattern {}: {}", pattern, e),
        }
    }

    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const BUILD: &str = "id: build\nname: Build\ntags: [ci, rust]\njobs:\n  compile:\n    steps:\n      - run: make\n";
    const DOCS: &str = "name: Docs\ntags: [docs]\njobs:\n  render:\n    steps:\n      - run: mdbook build\n";

    #[test]
    fn test_discovers_yaml_files_and_skips_invalid() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("build.yml"), BUILD).unwrap();
        fs::write(dir.path().join("docs.yaml"), DOCS).unwrap();
        fs::write(dir.path().join("broken.yml"), "jobs: [").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry =
            WorkflowRegistry::discover(&[(dir.path().to_path_buf(), WorkflowOrigin::Global)]);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("build").is_some());
        assert_eq!(registry.get("docs").unwrap().name, "Docs");
        assert_eq!(registry.get("DOCS").unwrap().name, "Docs");
        assert!(registry.get("broken").is_none());
    }

    #[test]
    fn test_local_overrides_global() {
        let global = tempdir().unwrap();
        let local = tempdir().unwrap();
        fs::write(global.path().join("build.yml"), BUILD).unwrap();
        fs::write(
            local.path().join("build.yml"),
            BUILD.replace("name: Build", "name: Local Build"),
        )
        .unwrap();

        let registry = WorkflowRegistry::discover(&[
            (global.path().to_path_buf(), WorkflowOrigin::Global),
            (local.path().to_path_buf(), WorkflowOrigin::Local),
        ]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("build").unwrap().name, "Local Build");
        assert_eq!(registry.origin("build"), Some(WorkflowOrigin::Local));
        assert_eq!(registry.get("local_build").unwrap().id, "build");
    }

    #[test]
    fn test_find_by_tags() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("build.yml"), BUILD).unwrap();
        fs::write(dir.path().join("docs.yml"), DOCS).unwrap();
        let registry =
            WorkflowRegistry::discover(&[(dir.path().to_path_buf(), WorkflowOrigin::Global)]);

        let ci: Vec<&str> = registry
            .find_by_tags(&["ci".to_string()])
            .iter()
            .map(|e| e.workflow.id.as_str())
            .collect();
        assert_eq!(ci, vec!["build"]);
        assert!(registry
            .find_by_tags(&["ci".to_string(), "docs".to_string()])
            .is_empty());
        assert_eq!(registry.find_by_tags(&[]).len(), 2);
    }

    #[test]
    fn test_missing_directory_and_require() {
        let registry = WorkflowRegistry::discover(&[(
            PathBuf::from("/nonexistent/workflows"),
            WorkflowOrigin::Local,
        )]);
        assert!(registry.is_empty());
        assert!(matches!(
            registry.require("nope"),
            Err(WorkflowError::WorkflowNotFound(_))
        ));
    }
}
