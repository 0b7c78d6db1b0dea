//! Subcommand implementations

use crate::commands::{ProxiesArgs, ReportArgs, RunArgs, ServeArgs};
use crate::error::{CliError, CliResult};
use crate::output::StatusPrinter;
use std::path::Path;
use std::process::ExitCode;
use testem_harness::{HarnessConfig, LifecycleOrchestrator, Reporter, SummaryReporter, SUMMARY_TEXT};
use tokio::process::Command;
use tracing::{info, warn};

/// Environment variable carrying the proxy table as JSON
pub const PROXIES_ENV: &str = "TESTEM_HARNESS_PROXIES";
/// Environment variable carrying the coverage upload URL
pub const COVERAGE_URL_ENV: &str = "TESTEM_HARNESS_COVERAGE_URL";

/// Load the configuration file, applying a port override
pub fn load_config(path: &Path, port: Option<u16>) -> CliResult<HarnessConfig> {
    if !path.is_file() {
        return Err(CliError::config(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }
    let mut config = HarnessConfig::from_file(path)?;
    if config.base_dir.is_none() {
        config.base_dir = path.parent().map(Path::to_path_buf).filter(|p| !p.as_os_str().is_empty());
    }
    if let Some(port) = port {
        config.coverage_port = port;
    }
    config.validate()?;
    Ok(config)
}

/// Start the fixtures and keep serving until ctrl-c
pub async fn serve(config_path: &Path, args: &ServeArgs, out: &StatusPrinter) -> CliResult<ExitCode> {
    let orchestrator = LifecycleOrchestrator::from_config(load_config(config_path, args.port)?)?;

    let ready = orchestrator.runner_starting().await;
    out.chain(&ready);
    if let Some(failure) = ready.failure {
        out.chain(&orchestrator.runner_exiting().await);
        return Err(CliError::startup(failure.step, failure.error.to_string()));
    }

    if let Some(path) = &args.proxies_out {
        orchestrator.write_proxy_map(path).await?;
    }
    out.info(&format!("serving on {}", orchestrator.server().base_url()));
    out.proxies(&orchestrator.proxy_map());
    out.info(&format!("coverage uploads: {}", orchestrator.server().coverage_url()));

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");

    let done = orchestrator.runner_exiting().await;
    out.chain(&done);
    Ok(if done.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Start the fixtures, run `args.command`, then shut down.
///
/// The exit code is the command's own unless shutdown fails.
pub async fn run(config_path: &Path, args: &RunArgs, out: &StatusPrinter) -> CliResult<ExitCode> {
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| CliError::invalid_argument("no command given"))?;
    let orchestrator = LifecycleOrchestrator::from_config(load_config(config_path, args.port)?)?;

    let ready = orchestrator.runner_starting().await;
    out.chain(&ready);
    if let Some(failure) = ready.failure {
        warn!(step = %failure.step, "startup failed, skipping command");
        out.chain(&orchestrator.runner_exiting().await);
        return Err(CliError::startup(failure.step, failure.error.to_string()));
    }

    let status = match spawn_runner(&orchestrator, program, rest).await {
        Ok(status) => status,
        Err(err) => {
            out.chain(&orchestrator.runner_exiting().await);
            return Err(err);
        }
    };
    info!(program = %program, code = ?status.code(), "runner finished");

    let done = orchestrator.runner_exiting().await;
    out.chain(&done);
    if !done.is_success() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from))
}

async fn spawn_runner(
    orchestrator: &LifecycleOrchestrator,
    program: &str,
    args: &[String],
) -> CliResult<std::process::ExitStatus> {
    let proxies = orchestrator.proxy_map().to_json_pretty()?;
    Command::new(program)
        .args(args)
        .env(PROXIES_ENV, proxies)
        .env(COVERAGE_URL_ENV, orchestrator.server().coverage_url())
        .status()
        .await
        .map_err(|source| CliError::RunnerLaunch {
            program: program.to_string(),
            source,
        })
}

/// Print or write the proxy table without starting anything
pub async fn proxies(config_path: &Path, args: &ProxiesArgs, out: &StatusPrinter) -> CliResult<ExitCode> {
    let orchestrator = LifecycleOrchestrator::from_config(load_config(config_path, None)?)?;
    match &args.output {
        Some(path) => {
            orchestrator.write_proxy_map(path).await?;
            out.info(&format!("proxy table written to {}", path.display()));
        }
        None => println!("{}", orchestrator.proxy_map().to_json_pretty()?),
    }
    Ok(ExitCode::SUCCESS)
}

/// Summarize an existing coverage directory
pub async fn report(args: &ReportArgs, out: &StatusPrinter) -> CliResult<ExitCode> {
    if !args.coverage_dir.is_dir() {
        return Err(CliError::invalid_argument(format!(
            "coverage directory not found: {}",
            args.coverage_dir.display()
        )));
    }
    let outcome = SummaryReporter
        .report(&args.coverage_dir, &args.reports_dir)
        .await?;
    out.info(&format!(
        "{} coverage file(s) summarized into {}",
        outcome.files_read,
        args.reports_dir.display()
    ));
    if !out.quiet {
        let text = tokio::fs::read_to_string(args.reports_dir.join(SUMMARY_TEXT)).await?;
        print!("{text}");
    }
    Ok(ExitCode::SUCCESS)
}
