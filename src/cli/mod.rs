use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;

use crate::pty::PtyConfig;

#[derive(Parser, Debug)]
#[command(
    name = "stint",
    about = "Run a formatter or linter, then drop the changes you ignored before"
)]
pub struct Cli {
    /// Name of the tool being run (e.g. your formatter), to keep one ignore
    /// list per tool.
    #[arg(long, value_name = "TOOL_ID")]
    pub tool_id: Option<String>,

    /// Remove ignore rules that matched nothing in this run.
    #[arg(long)]
    pub autopurge: bool,

    /// Poll timeout of the hunk-review driver in milliseconds (0 busy-polls).
    #[arg(long, value_name = "MS", default_value = "0")]
    pub poll_ms: u64,

    /// Increase log verbosity (-v info, -vv debug). `STINT_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// The tool to run, followed by its arguments.
    #[arg(
        value_name = "TOOL",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub tool: Vec<String>,
}

impl Cli {
    pub fn pty_config(&self) -> PtyConfig {
        PtyConfig {
            poll_timeout: Duration::from_millis(self.poll_ms),
            ..PtyConfig::default()
        }
    }

    /// Default log level for the requested verbosity.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Parse CLI arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
