use crate::{Change, ChangeRecord};
use std::str::Lines;

/// Extract every contiguous run of added/removed lines from diff text.
///
/// Works on full multi-file `git diff` output as well as on the patch text a
/// hunk-review prompt echoes, which may lack file headers (hence
/// `default_path`) and may contain stray answer echoes. The returned iterator
/// is lazy and `Clone`, so the same input can be walked again from the start.
pub fn extract_changes<'a>(input: &'a str, default_path: Option<&'a str>) -> ChangeExtractor<'a> {
    ChangeExtractor {
        lines: input.lines(),
        default_path,
        before_path: None,
        after_path: None,
        in_header: true,
        change: Change::new(),
    }
}

/// Iterator returned by [`extract_changes`].
#[derive(Debug, Clone)]
pub struct ChangeExtractor<'a> {
    lines: Lines<'a>,
    default_path: Option<&'a str>,
    before_path: Option<String>,
    after_path: Option<String>,
    /// Between a `diff `/`index ` line (or start of input) and the first `@@ `.
    in_header: bool,
    change: Change,
}

impl ChangeExtractor<'_> {
    /// Path a change is attributed to: the "before" side, the "after" side
    /// for new files, then the caller's default.
    fn current_path(&self) -> Option<String> {
        self.before_path
            .clone()
            .or_else(|| self.after_path.clone())
            .or_else(|| self.default_path.map(str::to_string))
    }

    fn flush(&mut self) -> Option<ChangeRecord> {
        if self.change.is_empty() {
            return None;
        }
        let change = std::mem::take(&mut self.change);
        Some(ChangeRecord {
            path: self.current_path(),
            change,
        })
    }

    /// Feed one line, returning a completed record if the line closed one.
    fn feed(&mut self, line: &str) -> Option<ChangeRecord> {
        // Terminal echo of the answers we type into the review program.
        if matches!(line, "y" | "n" | "s") {
            return None;
        }

        if line.starts_with("diff ") {
            let done = self.flush();
            self.before_path = line.strip_prefix("diff --git ").and_then(parse_git_header);
            self.after_path = None;
            self.in_header = true;
            return done;
        }

        if line.starts_with("index ") {
            self.in_header = true;
            return self.flush();
        }

        if line.starts_with("@@ ") {
            self.in_header = false;
            return self.flush();
        }

        if self.in_header {
            if let Some(rest) = line.strip_prefix("--- ") {
                self.before_path = parse_path_marker(rest, "a/");
                return None;
            }
            if let Some(rest) = line.strip_prefix("+++ ") {
                self.after_path = parse_path_marker(rest, "b/");
                return None;
            }
        }

        if line.starts_with('+') || line.starts_with('-') {
            self.change.push(line);
            return None;
        }

        if line.starts_with('\\') {
            if !self.change.is_empty() {
                self.change.push(line);
            }
            return None;
        }

        // Context line: closes the current run.
        self.flush()
    }
}

impl Iterator for ChangeExtractor<'_> {
    type Item = ChangeRecord;

    fn next(&mut self) -> Option<ChangeRecord> {
        while let Some(line) = self.lines.next() {
            if let Some(record) = self.feed(line) {
                return Some(record);
            }
        }
        self.flush()
    }
}

/// Last file path named by a diff header in `input`, if any.
///
/// Review prompts print a file's header only before its first hunk, so this
/// is what later headerless hunks of the same file belong to.
pub fn header_path(input: &str) -> Option<String> {
    let mut extractor = extract_changes(input, None);
    let mut found = None;
    for line in input.lines() {
        extractor.feed(line);
        if let Some(path) = extractor.before_path.as_ref().or(extractor.after_path.as_ref()) {
            found = Some(path.clone());
        }
    }
    found
}

/// Path of a `diff --git a/P b/P` line when both sides name the same file.
fn parse_git_header(rest: &str) -> Option<String> {
    let rest = rest.strip_prefix("a/")?;
    let len = rest.len().checked_sub(3)? / 2;
    let (before, after) = (rest.get(..len)?, rest.get(len..)?);
    (after.strip_prefix(" b/")? == before && !before.is_empty()).then(|| before.to_string())
}

/// Parse the path of a `---`/`+++` marker, dropping the side prefix.
///
/// Returns `None` for `/dev/null`.
fn parse_path_marker(raw: &str, prefix: &str) -> Option<String> {
    let raw = raw.trim_end_matches('\t');
    let raw = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(raw);
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}
