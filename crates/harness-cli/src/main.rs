//! testem-harness: fixtures and coverage collection around a browser test runner
//!
//! Usage:
//!   testem-harness serve                 # Serve until ctrl-c
//!   testem-harness run -- testem ci      # Wrap a runner command
//!   testem-harness proxies               # Print the proxy table
//!   testem-harness report --coverage-dir coverage

use clap::Parser;
use std::process::ExitCode;
use testem_harness_cli::{
    handlers, init_logging, Cli, CliConfig, CliError, CliResult, ColorChoice, Commands,
    StatusPrinter, Verbosity,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<ExitCode> {
    let config = build_config(&cli);
    let use_color = config.color.should_color();
    init_logging(config.verbosity, use_color);
    let out = StatusPrinter::new(use_color, config.verbosity.is_quiet());

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::config(format!("Failed to create runtime: {e}")))?;

    rt.block_on(async {
        match &cli.command {
            Commands::Serve(args) => handlers::serve(&cli.config, args, &out).await,
            Commands::Run(args) => handlers::run(&cli.config, args, &out).await,
            Commands::Proxies(args) => handlers::proxies(&cli.config, args, &out).await,
            Commands::Report(args) => handlers::report(args, &out).await,
        }
    })
}

fn build_config(cli: &Cli) -> CliConfig {
    CliConfig::new()
        .with_verbosity(Verbosity::from_flags(cli.quiet, cli.verbose))
        .with_color(ColorChoice::from(cli.color))
}
