use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not in a git repository")]
    NotARepo,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn git(repo: &Path) -> Command {
    let mut command = Command::new("git");
    command.current_dir(repo);
    command
}

/// Run a non-interactive git command in `repo` and return its stdout.
fn capture(repo: &Path, args: &[&str]) -> Result<String> {
    let output = git(repo).args(args).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(GitError::from)
}

/// Run a git command in `repo` with the terminal handed over to it.
fn interactive(repo: &Path, args: &[&str]) -> Result<ExitStatus> {
    let status = git(repo)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()?;
    Ok(status)
}

fn checked(args: &[&str], status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(GitError::CommandFailed(format!(
            "git {} exited with {}",
            args.join(" "),
            status
        )))
    }
}

/// Find the root of the git repository containing the current directory.
pub fn find_repo_root() -> Result<PathBuf> {
    let output = Command::new("git")
        .arg("rev-parse")
        .arg("--show-toplevel")
        .output()?;

    if !output.status.success() {
        return Err(GitError::NotARepo);
    }

    let path = String::from_utf8(output.stdout)?.trim().to_string();

    Ok(PathBuf::from(path))
}

/// Whether tracked files have no staged or unstaged modifications.
pub fn is_clean(repo: &Path) -> Result<bool> {
    let status = capture(repo, &["status", "--porcelain", "--untracked-files=no"])?;
    Ok(status.trim().is_empty())
}

/// Unified diff of the working tree against the index.
pub fn diff_worktree(repo: &Path) -> Result<String> {
    capture(repo, &["diff", "--no-ext-diff", "--no-color"])
}

/// Command line of the interactive "discard hunks from worktree" program.
pub fn checkout_patch_argv(repo: &Path) -> Vec<String> {
    vec![
        "git".to_string(),
        "-C".to_string(),
        repo.to_string_lossy().into_owned(),
        "-c".to_string(),
        "color.ui=never".to_string(),
        "checkout".to_string(),
        "-p".to_string(),
    ]
}

/// Let the operator stage the changes they want to keep (`git add -p`).
pub fn add_patch(repo: &Path) -> Result<()> {
    let args = ["add", "-p"];
    checked(&args, interactive(repo, &args)?)
}

/// Drop every unstaged change to tracked files (`git restore .`).
pub fn restore_worktree(repo: &Path) -> Result<()> {
    capture(repo, &["restore", "."]).map(drop)
}

/// Unstage everything, keeping working tree contents (`git reset`).
pub fn reset_index(repo: &Path) -> Result<()> {
    capture(repo, &["reset", "--quiet"]).map(drop)
}
