//! Watch Filters
//!
//! Decides whether a file-system event is relevant to a trigger:
//! - Location under one of the watched roots, honouring `recursive` and
//!   `max_depth` (a file directly inside a root has depth 0)
//! - Name patterns: globs by default, regular expressions with a `re:` prefix
//! - Owner and group by numeric id or name
//! - Inclusive size bounds

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Group, Uid, User};
use serde::Deserialize;

use super::EventError;

/// File metadata needed by the owner, group and size predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFacts {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
}

impl FileFacts {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            uid: metadata.uid(),
            gid: metadata.gid(),
        }
    }

    /// Reads metadata for `path`; `None` when the file is gone.
    pub fn read(path: &Path) -> Option<Self> {
        fs::metadata(path).ok().map(|m| Self::from_metadata(&m))
    }
}

/// A file-name pattern.
#[derive(Debug, Clone)]
pub enum FilePattern {
    Glob(glob::Pattern),
    Regex(regex::Regex),
}

impl FilePattern {
    /// Compiles a pattern; `re:` selects a regular expression.
    pub fn parse(pattern: &str) -> Result<Self, EventError> {
        if let Some(expr) = pattern.strip_prefix("re:") {
            regex::Regex::new(expr)
                .map(Self::Regex)
                .map_err(|e| EventError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })
        } else {
            glob::Pattern::new(pattern)
                .map(Self::Glob)
                .map_err(|e| EventError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })
        }
    }

    /// Globs containing `/` match the path relative to the watched root;
    /// everything else matches the file name.
    pub fn matches(&self, name: &str, relative: &Path) -> bool {
        match self {
            Self::Glob(glob) if glob.as_str().contains('/') => glob.matches_path(relative),
            Self::Glob(glob) => glob.matches(name),
            Self::Regex(regex) => regex.is_match(name),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Glob(glob) => glob.as_str(),
            Self::Regex(regex) => regex.as_str(),
        }
    }
}

impl PartialEq for FilePattern {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Glob(_), Self::Glob(_)) | (Self::Regex(_), Self::Regex(_))
        ) && self.as_str() == other.as_str()
    }
}

/// Numeric id or name, as written in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdOrName {
    Id(u32),
    Name(String),
}

impl IdOrName {
    fn into_string(self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::Name(name) => name,
        }
    }
}

/// Raw `trigger:` block of an event definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchFilterSpec {
    #[serde(default, deserialize_with = "crate::workflow::parser::one_or_many")]
    pub paths: Vec<String>,
    #[serde(default, deserialize_with = "crate::workflow::parser::one_or_many")]
    pub patterns: Vec<String>,
    #[serde(default, deserialize_with = "crate::workflow::parser::one_or_many")]
    pub include_patterns: Vec<String>,
    #[serde(default, deserialize_with = "crate::workflow::parser::one_or_many")]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
    pub max_depth: Option<usize>,
    pub owner: Option<IdOrName>,
    pub group: Option<IdOrName>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

/// Compiled watch filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WatchFilter {
    /// Watched roots
    pub paths: Vec<PathBuf>,
    /// File must match one of these (when any)
    pub patterns: Vec<FilePattern>,
    /// File must also match one of these (when any)
    pub include: Vec<FilePattern>,
    /// File must match none of these
    pub exclude: Vec<FilePattern>,
    pub recursive: bool,
    pub max_depth: Option<usize>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

fn compile_all(patterns: &[String]) -> Result<Vec<FilePattern>, EventError> {
    patterns.iter().map(|p| FilePattern::parse(p)).collect()
}

/// Expands `~` and resolves relative paths against `base_dir`.
pub fn resolve_watch_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = match raw.strip_prefix("~") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(raw),
        },
        _ => PathBuf::from(raw),
    };

    let absolute = match base_dir {
        Some(base) if expanded.is_relative() => base.join(expanded),
        _ => expanded,
    };

    fs::canonicalize(&absolute).unwrap_or(absolute)
}

impl WatchFilter {
    /// Creates a filter watching a single root, non-recursively.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
            ..Default::default()
        }
    }

    /// Compiles a raw filter, rejecting invalid patterns.
    pub fn from_spec(spec: WatchFilterSpec, base_dir: Option<&Path>) -> Result<Self, EventError> {
        Ok(Self {
            paths: spec
                .paths
                .iter()
                .map(|p| resolve_watch_path(p, base_dir))
                .collect(),
            patterns: compile_all(&spec.patterns)?,
            include: compile_all(&spec.include_patterns)?,
            exclude: compile_all(&spec.exclude_patterns)?,
            recursive: spec.recursive,
            max_depth: spec.max_depth,
            owner: spec.owner.map(IdOrName::into_string),
            group: spec.group.map(IdOrName::into_string),
            min_size: spec.min_size,
            max_size: spec.max_size,
        })
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, EventError> {
        self.patterns.push(FilePattern::parse(pattern)?);
        Ok(self)
    }

    pub fn with_exclude(mut self, pattern: &str) -> Result<Self, EventError> {
        self.exclude.push(FilePattern::parse(pattern)?);
        Ok(self)
    }

    pub fn recursive(mut self, max_depth: Option<usize>) -> Self {
        self.recursive = true;
        self.max_depth = max_depth;
        self
    }

    pub fn with_size(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Whether any predicate needs file metadata.
    pub fn needs_metadata(&self) -> bool {
        self.owner.is_some()
            || self.group.is_some()
            || self.min_size.is_some()
            || self.max_size.is_some()
    }

    /// Finds the watched root containing `path` within the depth limits and
    /// returns the path relative to it.
    pub fn locate<'p>(&self, path: &'p Path) -> Option<&'p Path> {
        self.paths.iter().find_map(|root| {
            let relative = path.strip_prefix(root).ok()?;
            let depth = relative.components().count().checked_sub(1)?;
            if !self.recursive && depth > 0 {
                return None;
            }
            if matches!(self.max_depth, Some(max) if depth > max) {
                return None;
            }
            Some(relative)
        })
    }

    /// Checks every predicate against a path and its metadata.
    pub fn matches(&self, path: &Path, facts: Option<&FileFacts>) -> bool {
        let relative = match self.locate(path) {
            Some(relative) => relative,
            None => return false,
        };
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy(),
            None => return false,
        };

        if !self.patterns.is_empty() && !self.patterns.iter().any(|p| p.matches(&name, relative)) {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(&name, relative)) {
            return false;
        }
        if self.exclude.iter().any(|p| p.matches(&name, relative)) {
            return false;
        }

        if !self.needs_metadata() {
            return true;
        }
        let facts = match facts {
            Some(facts) => facts,
            None => return false,
        };

        if let Some(owner) = &self.owner {
            if !owner_matches(owner, facts.uid) {
                return false;
            }
        }
        if let Some(group) = &self.group {
            if !group_matches(group, facts.gid) {
                return false;
            }
        }
        if matches!(self.min_size, Some(min) if facts.size < min) {
            return false;
        }
        if matches!(self.max_size, Some(max) if facts.size > max) {
            return false;
        }

        true
    }
}

fn owner_matches(expected: &str, uid: u32) -> bool {
    if let Ok(id) = expected.parse::<u32>() {
        return id == uid;
    }
    matches!(User::from_uid(Uid::from_raw(uid)), Ok(Some(user)) if user.name == expected)
}

fn group_matches(expected: &str, gid: u32) -> bool {
    if let Ok(id) = expected.parse::<u32>() {
        return id == gid;
    }
    matches!(Group::from_gid(Gid::from_raw(gid)), Ok(Some(group)) if group.name == expected)
}
