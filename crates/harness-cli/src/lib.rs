//! testem-harness CLI library
//!
//! Command-line front end for [`testem_harness`]: serve fixtures for a
//! browser runner, wrap a runner command, print the proxy table or
//! summarize coverage already on disk.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod config;
mod error;
pub mod handlers;
mod logging;
mod output;

pub use commands::{Cli, ColorArg, Commands, ProxiesArgs, ReportArgs, RunArgs, ServeArgs};
pub use config::{CliConfig, ColorChoice, Verbosity};
pub use error::{CliError, CliResult};
pub use logging::init_logging;
pub use output::{format_chain, StatusPrinter};
