use crate::Change;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while loading or saving ignore rules.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed ignore file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode ignore rules: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid tool id: {0}")]
    InvalidToolId(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Decision memory consulted by the hunk engine and fed by the recorder.
pub trait IgnorePolicy {
    /// Whether `change` in `path` was previously marked ignorable.
    ///
    /// Implementations may record the query to support pruning later.
    fn contains(&mut self, path: &str, change: &Change) -> bool;

    /// Mark `change` in `path` as ignorable.
    fn add(&mut self, path: &str, change: Change);
}

/// Path → ignored changes, in the on-disk layout.
pub type IgnoreMap = BTreeMap<String, Vec<Change>>;

/// A bare in-memory policy without usage tracking.
impl IgnorePolicy for IgnoreMap {
    fn contains(&mut self, path: &str, change: &Change) -> bool {
        self.get(path).is_some_and(|changes| changes.contains(change))
    }

    fn add(&mut self, path: &str, change: Change) {
        let changes = self.entry(path.to_string()).or_default();
        if !changes.contains(&change) {
            changes.push(change);
        }
    }
}

/// File name of the ignore list, optionally scoped to one tool.
///
/// Allows tool ids made of alphanumerics, dash, underscore and dot.
pub fn store_file_name(tool_id: Option<&str>) -> Result<String> {
    let Some(tool_id) = tool_id else {
        return Ok(".ignores.json".to_string());
    };
    if tool_id.is_empty()
        || tool_id.starts_with('.')
        || !tool_id
            .chars()
            .all(|ch| ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(StoreError::InvalidToolId(tool_id.to_string()));
    }
    Ok(format!(".ignores.{tool_id}.json"))
}

/// JSON-backed ignore list living at the repository root.
///
/// With `purge_unused`, every pair that was queried or added during the run
/// is remembered, and [`save`](Self::save) drops the rest.
pub struct IgnoreStore {
    path: PathBuf,
    ignores: IgnoreMap,
    purge_unused: bool,
    used: HashSet<(String, Change)>,
}

impl IgnoreStore {
    /// Load the ignore list at `path`. A missing file is an empty list.
    pub fn open(path: impl Into<PathBuf>, purge_unused: bool) -> Result<Self> {
        let path = path.into();
        let ignores = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => IgnoreMap::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        debug!(path = %path.display(), "loaded ignore list");
        Ok(Self {
            path,
            ignores,
            purge_unused,
            used: HashSet::new(),
        })
    }

    /// Load the ignore list for `tool_id` in `repo_root`.
    pub fn open_in(repo_root: &Path, tool_id: Option<&str>, purge_unused: bool) -> Result<Self> {
        Self::open(repo_root.join(store_file_name(tool_id)?), purge_unused)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &IgnoreMap {
        &self.ignores
    }

    /// Total number of ignored changes across all paths.
    pub fn len(&self) -> usize {
        self.ignores.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the list back to disk, pruning unused entries if configured.
    pub fn save(&mut self) -> Result<()> {
        if self.purge_unused {
            let before = self.len();
            let used = &self.used;
            for (path, changes) in self.ignores.iter_mut() {
                changes.retain(|change| used.contains(&(path.clone(), change.clone())));
            }
            self.ignores.retain(|_, changes| !changes.is_empty());
            info!(removed = before - self.len(), "purged unused ignore rules");
        }

        let mut text = serde_json::to_string_pretty(&self.ignores)?;
        text.push('\n');
        fs::write(&self.path, text).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), rules = self.len(), "saved ignore list");
        Ok(())
    }

    fn mark_used(&mut self, path: &str, change: &Change) {
        if self.purge_unused {
            self.used.insert((path.to_string(), change.clone()));
        }
    }
}

impl IgnorePolicy for IgnoreStore {
    fn contains(&mut self, path: &str, change: &Change) -> bool {
        self.mark_used(path, change);
        self.ignores.contains(path, change)
    }

    fn add(&mut self, path: &str, change: Change) {
        self.mark_used(path, &change);
        self.ignores.add(path, change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(lines: &[&str]) -> Change {
        lines.iter().copied().collect()
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = IgnoreStore::open(dir.path().join(".ignores.json"), false).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn add_then_contains() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IgnoreStore::open(dir.path().join(".ignores.json"), false).unwrap();
        store.add("a.txt", change(&["+foo"]));

        assert!(store.contains("a.txt", &change(&["+foo"])));
        assert!(!store.contains("b.txt", &change(&["+foo"])));
        assert!(!store.contains("a.txt", &change(&["+bar"])));
    }

    #[test]
    fn duplicates_are_not_stored_twice() {
        let mut map = IgnoreMap::new();
        map.add("a.txt", change(&["-x", "+y"]));
        map.add("a.txt", change(&["-x", "+y"]));
        assert_eq!(map["a.txt"].len(), 1);
    }

    #[test]
    fn reads_existing_json_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ignores.json");
        fs::write(&path, r#"{"a.txt": [["+foo"], ["-old", "+new"]]}"#).unwrap();

        let mut store = IgnoreStore::open(&path, false).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains("a.txt", &change(&["-old", "+new"])));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ignores.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            IgnoreStore::open(&path, false),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn store_file_name_for_tool() {
        assert_eq!(store_file_name(None).unwrap(), ".ignores.json");
        assert_eq!(
            store_file_name(Some("rustfmt")).unwrap(),
            ".ignores.rustfmt.json"
        );
        assert!(store_file_name(Some("../evil")).is_err());
        assert!(store_file_name(Some("")).is_err());
        assert!(store_file_name(Some("a b")).is_err());
    }
}
