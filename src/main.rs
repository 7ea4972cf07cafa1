use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stint::cli::{self, Cli};
use stint::engine::revert_ignored_changes;
use stint::git;
use stint::pty::PtyConfig;
use stint::recorder::remember_discarded_changes;
use stint::store::IgnoreStore;

fn main() -> Result<()> {
    let args = cli::parse_args();
    init_tracing(&args);

    let repo_root = git::find_repo_root().context("stint must run inside a git repository")?;

    if !git::is_clean(&repo_root)? {
        bail!("Aborting, Git repo is not clean.");
    }

    let mut store = IgnoreStore::open_in(&repo_root, args.tool_id.as_deref(), args.autopurge)
        .context("Failed to load ignore rules")?;

    run_tool(&args.tool)?;

    let outcome = review_changes(&repo_root, &mut store, args.pty_config());

    // The tree is reset whether or not the review went through: rejected
    // changes are dropped, approved ones stay in the working tree unstaged.
    let cleanup = cleanup_worktree(&repo_root);
    outcome?;
    cleanup
}

fn init_tracing(args: &Cli) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(args.log_level().into())
        .with_env_var("STINT_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Run the wrapped formatter/linter. Its exit code is informational only.
fn run_tool(argv: &[String]) -> Result<()> {
    let (program, tool_args) = argv.split_first().context("No tool given")?;
    let status = Command::new(program)
        .args(tool_args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to execute {program}"))?;

    if !status.success() {
        warn!(tool = %program, %status, "tool exited unsuccessfully, continuing");
    }
    Ok(())
}

/// Discard ignored hunks, let the operator review the rest, and remember
/// whatever they rejected.
fn review_changes(repo_root: &Path, store: &mut IgnoreStore, config: PtyConfig) -> Result<()> {
    let report = revert_ignored_changes(&git::checkout_patch_argv(repo_root), store, config)
        .context("Failed to discard ignored changes")?;
    if !report.completed() {
        bail!(
            "git checkout -p did not finish cleanly ({:?}, {})",
            report.end,
            report.status
        );
    }
    info!(
        discarded = report.stats.discarded,
        kept = report.stats.kept,
        "discarded ignored hunks"
    );

    git::add_patch(repo_root).context("git add -p failed")?;

    remember_discarded_changes(repo_root, store).context("Failed to record rejected changes")?;
    store
        .save()
        .with_context(|| format!("Failed to save {}", store.path().display()))?;
    Ok(())
}

fn cleanup_worktree(repo_root: &Path) -> Result<()> {
    git::restore_worktree(repo_root).context("Failed to drop rejected changes")?;
    git::reset_index(repo_root).context("Failed to unstage approved changes")?;
    Ok(())
}
