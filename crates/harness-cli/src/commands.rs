//! CLI command definitions

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Serve, instrument and collect coverage around a browser test runner
#[derive(Parser, Debug)]
#[command(name = "testem-harness")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorArg,

    /// Harness configuration file (JSON or YAML)
    #[arg(
        short,
        long,
        env = "TESTEM_HARNESS_CONFIG",
        default_value = "testem-harness.json",
        global = true
    )]
    pub config: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Color argument
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ColorArg {
    /// Always use colors
    Always,
    /// Auto-detect
    #[default]
    Auto,
    /// Never use colors
    Never,
}

impl From<ColorArg> for crate::config::ColorChoice {
    fn from(arg: ColorArg) -> Self {
        match arg {
            ColorArg::Always => Self::Always,
            ColorArg::Auto => Self::Auto,
            ColorArg::Never => Self::Never,
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the content server and collect coverage until interrupted
    Serve(ServeArgs),

    /// Run a test command between startup and shutdown
    Run(RunArgs),

    /// Print the proxy table the runner should install
    Proxies(ProxiesArgs),

    /// Summarize coverage files already on disk
    Report(ReportArgs),
}

/// Arguments for the serve command
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Override the configured port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Write the proxy table to this file once the server is up
    #[arg(long)]
    pub proxies_out: Option<PathBuf>,
}

/// Arguments for the run command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Override the configured port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Command to run once fixtures are up
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for the proxies command
#[derive(Args, Debug, Default)]
pub struct ProxiesArgs {
    /// Write the table to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the report command
#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Directory holding coverage-*.json files
    #[arg(long)]
    pub coverage_dir: PathBuf,

    /// Directory to write the summary into
    #[arg(long, default_value = "reports")]
    pub reports_dir: PathBuf,
}
