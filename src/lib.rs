pub mod cli;
pub mod engine;
pub mod git;
pub mod parser;
pub mod pty;
pub mod recorder;
pub mod store;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of a single line inside a [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Added,
    Removed,
    /// `\ No newline at end of file` annotation of the preceding line.
    NoNewline,
}

/// One contiguous run of added/removed lines from a diff hunk.
///
/// Lines keep their leading `+`/`-` marker, so two changes are equal exactly
/// when their ordered, tagged line sequences are equal. Serialized as a plain
/// array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Change(Vec<String>);

impl Change {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.0.push(line.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.0
    }

    /// Iterate over the lines together with their kind.
    pub fn tagged_lines(&self) -> impl Iterator<Item = (LineKind, &str)> {
        self.0.iter().map(|line| {
            let kind = if line.starts_with('+') {
                LineKind::Added
            } else if line.starts_with('-') {
                LineKind::Removed
            } else {
                LineKind::NoNewline
            };
            (kind, line.as_str())
        })
    }

    /// Short SHA-256 digest of the change, for log output.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for line in &self.0 {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..12].to_string()
    }
}

impl<S: Into<String>> FromIterator<S> for Change {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A change together with the repository-relative path it was extracted from.
///
/// `path` is `None` only when the diff text carried no path marker and the
/// caller supplied no default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub path: Option<String>,
    pub change: Change,
}
