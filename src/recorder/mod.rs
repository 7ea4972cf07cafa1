use std::path::Path;

use tracing::{info, warn};

use crate::git;
use crate::parser::extract_changes;
use crate::store::IgnorePolicy;

/// Add every change in `diff` to `policy`. Returns how many were recorded.
///
/// `diff` is full `git diff` output, so every change carries its own path;
/// a change without one is skipped.
pub fn record_changes<P: IgnorePolicy + ?Sized>(diff: &str, policy: &mut P) -> usize {
    let mut recorded = 0;
    for record in extract_changes(diff, None) {
        let Some(path) = record.path else {
            warn!(change = %record.change.fingerprint(), "skipping change without a path");
            continue;
        };
        policy.add(&path, record.change);
        recorded += 1;
    }
    recorded
}

/// Remember what the operator left unstaged in `repo` as ignorable.
pub fn remember_discarded_changes<P: IgnorePolicy + ?Sized>(
    repo: &Path,
    policy: &mut P,
) -> git::Result<usize> {
    let diff = git::diff_worktree(repo)?;
    let recorded = record_changes(&diff, policy);
    info!(recorded, "remembered rejected changes");
    Ok(recorded)
}
