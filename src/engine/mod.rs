use std::process::ExitStatus;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::parser::{extract_changes, header_path};
use crate::pty::{PtyConfig, PtyError, PtySession, StreamEnd};
use crate::store::IgnorePolicy;
use crate::ChangeRecord;

/// Phrase the review program prints when asking whether to discard a hunk.
pub const DISCARD_HUNK_PROMPT: &str = "Discard this hunk from worktree";

/// Other discard questions (mode changes, whole-file deletions/additions).
/// These are always answered with "keep".
const OTHER_DISCARD_PROMPTS: [&str; 3] = [
    "Discard mode change from worktree",
    "Discard deletion from worktree",
    "Discard addition from worktree",
];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "no change found for a discard prompt; prompt tracking is out of sync with the review program\n--- prompt buffer ---\n{buffer}"
    )]
    EmptyExtraction { buffer: String },
    #[error("cannot tell which file a hunk belongs to\n--- prompt buffer ---\n{buffer}")]
    UnknownPath { buffer: String },
    #[error(transparent)]
    Pty(#[from] PtyError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Single-character answers understood by the review program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Discard,
    Keep,
    Split,
}

impl Answer {
    pub fn as_str(self) -> &'static str {
        match self {
            Answer::Discard => "y",
            Answer::Keep => "n",
            Answer::Split => "s",
        }
    }
}

/// Counts of answers given during a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionStats {
    pub discarded: usize,
    pub kept: usize,
    pub split: usize,
    /// Non-hunk discard questions, always kept.
    pub other_prompts: usize,
}

/// A line source that accepts typed answers.
pub trait PromptChannel: Iterator<Item = String> {
    fn writeline(&mut self, text: &str);
}

impl PromptChannel for PtySession {
    fn writeline(&mut self, text: &str) {
        PtySession::writeline(self, text);
    }
}

/// Answers the review program's discard prompts from an ignore policy.
///
/// Output lines accumulate in a prompt buffer until a discard prompt shows
/// up; the buffer is then parsed, matched, answered and cleared, so each
/// answer covers exactly the text seen since the previous one.
pub struct HunkDecisionEngine<'p, P: IgnorePolicy + ?Sized> {
    policy: &'p mut P,
    buffer: String,
    current_path: Option<String>,
    stats: DecisionStats,
}

impl<'p, P: IgnorePolicy + ?Sized> HunkDecisionEngine<'p, P> {
    pub fn new(policy: &'p mut P) -> Self {
        Self {
            policy,
            buffer: String::new(),
            current_path: None,
            stats: DecisionStats::default(),
        }
    }

    pub fn stats(&self) -> DecisionStats {
        self.stats
    }

    /// Path of the last file header seen, used for headerless prompts.
    pub fn current_path(&self) -> Option<&str> {
        self.current_path.as_deref()
    }

    /// Text accumulated since the last answer.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Feed one output line; returns the answer to type if it was a prompt.
    pub fn process_line(&mut self, line: &str) -> Result<Option<Answer>> {
        if is_prompt(line, DISCARD_HUNK_PROMPT) {
            let answer = self.decide()?;
            self.buffer.clear();
            return Ok(Some(answer));
        }

        if OTHER_DISCARD_PROMPTS.iter().any(|p| is_prompt(line, p)) {
            self.track_header();
            debug!(prompt = %line.trim(), "keeping non-hunk change");
            self.stats.other_prompts += 1;
            self.buffer.clear();
            return Ok(Some(Answer::Keep));
        }

        self.buffer.push_str(line);
        self.buffer.push('\n');
        Ok(None)
    }

    /// Follow the file header in the buffer, if the prompt starts a new file.
    ///
    /// Hunks split off a larger one come without a header, so this must
    /// happen before any decision, including a split.
    fn track_header(&mut self) {
        if let Some(path) = header_path(&self.buffer) {
            self.current_path = Some(path);
        }
    }

    fn decide(&mut self) -> Result<Answer> {
        self.track_header();
        let mut records: Vec<ChangeRecord> =
            extract_changes(&self.buffer, self.current_path.as_deref()).collect();

        if records.len() > 1 {
            debug!(
                path = self.current_path.as_deref().unwrap_or("?"),
                changes = records.len(),
                "prompt covers several changes, splitting"
            );
            self.stats.split += 1;
            return Ok(Answer::Split);
        }

        let Some(record) = records.pop() else {
            return Err(EngineError::EmptyExtraction {
                buffer: std::mem::take(&mut self.buffer),
            });
        };
        let Some(path) = record.path else {
            return Err(EngineError::UnknownPath {
                buffer: std::mem::take(&mut self.buffer),
            });
        };

        let ignored = self.policy.contains(&path, &record.change);
        let answer = if ignored {
            self.stats.discarded += 1;
            Answer::Discard
        } else {
            self.stats.kept += 1;
            Answer::Keep
        };
        debug!(
            path = %path,
            change = %record.change.fingerprint(),
            answer = answer.as_str(),
            "decided hunk"
        );
        self.current_path = Some(path);
        Ok(answer)
    }

    /// Drive `channel` until its output ends, answering every prompt.
    pub fn run<C: PromptChannel + ?Sized>(&mut self, channel: &mut C) -> Result<DecisionStats> {
        while let Some(line) = channel.next() {
            if let Some(answer) = self.process_line(&line)? {
                channel.writeline(answer.as_str());
            }
        }
        Ok(self.stats)
    }
}

/// A prompt line, as opposed to diff content quoting the same words.
fn is_prompt(line: &str, phrase: &str) -> bool {
    !line.starts_with([' ', '+', '-', '@', '\\']) && line.contains(phrase)
}

/// Outcome of a [`revert_ignored_changes`] session.
#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub stats: DecisionStats,
    pub status: ExitStatus,
    pub end: StreamEnd,
}

impl SessionReport {
    /// The review program ran to completion and exited successfully.
    pub fn completed(&self) -> bool {
        self.end == StreamEnd::ChildExited && self.status.success()
    }
}

/// Run the hunk-review program `argv` on a PTY and discard every hunk the
/// policy ignores.
///
/// The child is always reaped before returning. A terminal failure is not an
/// error here; check [`SessionReport::completed`].
pub fn revert_ignored_changes<P: IgnorePolicy + ?Sized>(
    argv: &[String],
    policy: &mut P,
    config: PtyConfig,
) -> Result<SessionReport> {
    let mut session = PtySession::spawn(argv, config)?;
    let mut engine = HunkDecisionEngine::new(policy);

    let stats = match engine.run(&mut session) {
        Ok(stats) => stats,
        Err(e) => {
            if let Err(err) = session.terminate() {
                warn!(pid = session.pid(), "failed to stop review program: {err}");
            }
            return Err(e);
        }
    };

    let end = session.end_reason().unwrap_or(StreamEnd::ChildExited);
    let status = match end {
        StreamEnd::ChildExited => session.wait()?,
        StreamEnd::TerminalError => session.terminate()?,
    };

    info!(
        discarded = stats.discarded,
        kept = stats.kept,
        split = stats.split,
        "hunk review finished"
    );
    Ok(SessionReport { stats, status, end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IgnoreMap;
    use crate::Change;
    use std::collections::VecDeque;

    struct Scripted {
        output: VecDeque<String>,
        answers: Vec<String>,
    }

    impl Scripted {
        fn new(text: &str) -> Self {
            Self {
                output: text.lines().map(str::to_string).collect(),
                answers: Vec::new(),
            }
        }
    }

    impl Iterator for Scripted {
        type Item = String;
        fn next(&mut self) -> Option<String> {
            self.output.pop_front()
        }
    }

    impl PromptChannel for Scripted {
        fn writeline(&mut self, text: &str) {
            self.answers.push(text.to_string());
        }
    }

    const PROMPT: &str = "(1/1) Discard this hunk from worktree [y,n,q,a,d,e,?]? ";

    fn policy_with(path: &str, lines: &[&str]) -> IgnoreMap {
        let mut map = IgnoreMap::new();
        map.insert(path.to_string(), vec![lines.iter().copied().collect::<Change>()]);
        map
    }

    fn header(path: &str) -> String {
        format!("diff --git a/{path} b/{path}\nindex 1111111..2222222 100644\n--- a/{path}\n+++ b/{path}\n")
    }

    #[test]
    fn ignored_hunk_is_discarded_and_others_kept() {
        let mut policy = policy_with("a.txt", &["+foo"]);
        let script = format!(
            "{}@@ -1,2 +1,3 @@\n keep\n+foo\n{PROMPT}\ny\n@@ -8,2 +9,3 @@\n keep\n+bar\n{PROMPT}\nn\n",
            header("a.txt")
        );
        let mut channel = Scripted::new(&script);
        let stats = HunkDecisionEngine::new(&mut policy)
            .run(&mut channel)
            .unwrap();
        assert_eq!(channel.answers, vec!["y", "n"]);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.kept, 1);
    }

    #[test]
    fn ambiguous_prompt_is_split() {
        let mut policy = IgnoreMap::new();
        let mut engine = HunkDecisionEngine::new(&mut policy);
        for line in ["@@ -1,5 +1,5 @@", "-a", "+A", " mid", "-b", "+B"] {
            assert_eq!(engine.process_line(line).unwrap(), None);
        }
        assert_eq!(engine.process_line(PROMPT).unwrap(), Some(Answer::Split));
        assert!(engine.buffer().is_empty());
        assert_eq!(engine.stats().split, 1);
    }

    #[test]
    fn empty_prompt_is_a_fatal_error_with_buffer() {
        let mut policy = IgnoreMap::new();
        let mut engine = HunkDecisionEngine::new(&mut policy);
        engine.process_line("Sorry, cannot split this hunk").unwrap();
        match engine.process_line(PROMPT) {
            Err(EngineError::EmptyExtraction { buffer }) => {
                assert!(buffer.contains("cannot split"));
            }
            other => panic!("expected EmptyExtraction, got {other:?}"),
        }
    }

    #[test]
    fn headerless_first_prompt_has_unknown_path() {
        let mut policy = IgnoreMap::new();
        let mut engine = HunkDecisionEngine::new(&mut policy);
        engine.process_line("+orphan").unwrap();
        assert!(matches!(
            engine.process_line(PROMPT),
            Err(EngineError::UnknownPath { .. })
        ));
    }

    #[test]
    fn path_carries_over_to_headerless_prompts() {
        let mut policy = policy_with("b.rs", &["-x", "+y"]);
        let script = format!(
            "{}@@ -1 +1 @@\n-a\n+b\n{PROMPT}\n@@ -9 +9 @@\n-x\n+y\n{PROMPT}\n",
            header("b.rs")
        );
        let mut channel = Scripted::new(&script);
        let mut engine = HunkDecisionEngine::new(&mut policy);
        engine.run(&mut channel).unwrap();
        assert_eq!(channel.answers, vec!["n", "y"]);
        assert_eq!(engine.current_path(), Some("b.rs"));
    }

    const FIVE_AND_SEVEN: &str = "@@ -4,5 +4,5 @@\n line 4\n-line 5\n+FIVE\n line 6\n-line 7\n+SEVEN\n line 8\n";

    /// What the review program prints after `s` for [`FIVE_AND_SEVEN`].
    fn split_five_and_seven() -> String {
        format!(
            "s\nSplit into 2 hunks.\n\
@@ -4,3 +4,3 @@\n line 4\n-line 5\n+FIVE\n line 6\n{PROMPT}\n\
@@ -6,3 +6,3 @@\n line 6\n-line 7\n+SEVEN\n line 8\n{PROMPT}\n"
        )
    }

    #[test]
    fn split_first_hunk_keeps_its_file_for_sub_hunks() {
        let mut policy = policy_with("a.txt", &["-line 5", "+FIVE"]);
        let script = format!(
            "{}{FIVE_AND_SEVEN}{PROMPT}\n{}",
            header("a.txt"),
            split_five_and_seven()
        );
        let mut channel = Scripted::new(&script);
        let mut engine = HunkDecisionEngine::new(&mut policy);
        let stats = engine.run(&mut channel).unwrap();
        assert_eq!(channel.answers, vec!["s", "y", "n"]);
        assert_eq!(stats.split, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.kept, 1);
        assert_eq!(engine.current_path(), Some("a.txt"));
    }

    #[test]
    fn split_in_later_file_is_matched_against_that_file() {
        let mut policy = policy_with("a.txt", &["-line 7", "+SEVEN"]);
        policy.add("b.txt", ["-line 5", "+FIVE"].into_iter().collect());
        let script = format!(
            "{}@@ -1,3 +1,3 @@\n line 1\n-line 2\n+TWO\n line 3\n{PROMPT}\nn\n{}{FIVE_AND_SEVEN}{PROMPT}\n{}",
            header("a.txt"),
            header("b.txt"),
            split_five_and_seven()
        );
        let mut channel = Scripted::new(&script);
        let mut engine = HunkDecisionEngine::new(&mut policy);
        engine.run(&mut channel).unwrap();
        // The SEVEN hunk is in b.txt, so a.txt's rule for it must not apply.
        assert_eq!(channel.answers, vec!["n", "s", "y", "n"]);
        assert_eq!(engine.current_path(), Some("b.txt"));
    }

    #[test]
    fn mode_change_header_names_following_hunks() {
        let mut policy = policy_with("bin/run", &["-x", "+y"]);
        let script = format!(
            "diff --git a/bin/run b/bin/run\nold mode 100644\nnew mode 100755\n\
(1/2) Discard mode change from worktree [y,n,q,a,d,j,J,g,/,?]? \nn\n\
@@ -1 +1 @@\n-x\n+y\n{PROMPT}\n"
        );
        let mut channel = Scripted::new(&script);
        let mut engine = HunkDecisionEngine::new(&mut policy);
        engine.run(&mut channel).unwrap();
        assert_eq!(channel.answers, vec!["n", "y"]);
        assert_eq!(engine.stats().other_prompts, 1);
    }

    #[test]
    fn same_change_in_other_file_is_not_ignored() {
        let mut policy = policy_with("a.txt", &["+foo"]);
        let script = format!("{}@@ -1 +1,2 @@\n x\n+foo\n{PROMPT}\n", header("other.txt"));
        let mut channel = Scripted::new(&script);
        HunkDecisionEngine::new(&mut policy)
            .run(&mut channel)
            .unwrap();
        assert_eq!(channel.answers, vec!["n"]);
    }

    #[test]
    fn quoted_prompt_phrase_in_content_is_not_a_prompt() {
        let mut policy = IgnoreMap::new();
        let mut engine = HunkDecisionEngine::new(&mut policy);
        let content = format!("+const P: &str = \"{DISCARD_HUNK_PROMPT}\";");
        assert_eq!(engine.process_line(&content).unwrap(), None);
        assert!(engine.buffer().contains(DISCARD_HUNK_PROMPT));
    }

    #[test]
    fn mode_change_prompts_are_kept_without_lookup() {
        let mut policy = IgnoreMap::new();
        let mut engine = HunkDecisionEngine::new(&mut policy);
        engine.process_line("old mode 100644").unwrap();
        let answer = engine
            .process_line("(1/2) Discard mode change from worktree [y,n,q,a,d,j,J,g,/,?]? ")
            .unwrap();
        assert_eq!(answer, Some(Answer::Keep));
        assert!(engine.buffer().is_empty());
        assert_eq!(engine.stats().other_prompts, 1);
    }

    #[test]
    fn each_prompt_answered_exactly_once() {
        let mut policy = policy_with("a.txt", &["+foo"]);
        let script = format!("{}@@ -1 +1,2 @@\n x\n+foo\n{PROMPT}\ny\n", header("a.txt"));
        let mut channel = Scripted::new(&script);
        HunkDecisionEngine::new(&mut policy)
            .run(&mut channel)
            .unwrap();
        assert_eq!(channel.answers, vec!["y"]);
    }
}
