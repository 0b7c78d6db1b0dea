//! Status output

use console::{style, Term};
use testem_harness::{ChainOutcome, ProxyMap};

/// Status line printer for the harness commands
#[derive(Debug)]
pub struct StatusPrinter {
    term: Term,
    /// Whether to use colors
    pub use_color: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl StatusPrinter {
    /// Create a printer writing to stderr
    #[must_use]
    pub fn new(use_color: bool, quiet: bool) -> Self {
        Self {
            term: Term::stderr(),
            use_color,
            quiet,
        }
    }

    /// Print an informational line
    pub fn info(&self, message: &str) {
        if self.quiet {
            return;
        }
        let line = if self.use_color {
            format!("{} {message}", style("::").cyan().bold())
        } else {
            format!(":: {message}")
        };
        let _ = self.term.write_line(&line);
    }

    /// Print the result of a lifecycle chain
    pub fn chain(&self, outcome: &ChainOutcome) {
        if self.quiet && outcome.is_success() {
            return;
        }
        let _ = self.term.write_line(&format_chain(outcome, self.use_color));
    }

    /// Print the proxy table, one mount per line
    pub fn proxies(&self, proxies: &ProxyMap) {
        if self.quiet {
            return;
        }
        for (path, target) in proxies.iter() {
            let line = if self.use_color {
                format!("   {} -> {}", style(path).bold(), target.target)
            } else {
                format!("   {path} -> {}", target.target)
            };
            let _ = self.term.write_line(&line);
        }
    }
}

/// Render a chain outcome as a single line
#[must_use]
pub fn format_chain(outcome: &ChainOutcome, use_color: bool) -> String {
    let millis = outcome.elapsed.as_millis();
    match &outcome.failure {
        None => {
            let mark = if use_color {
                style("ok").green().bold().to_string()
            } else {
                "ok".to_string()
            };
            format!(
                "{mark} {} ({} steps, {millis}ms)",
                outcome.chain,
                outcome.completed.len()
            )
        }
        Some(failure) => {
            let mark = if use_color {
                style("FAILED").red().bold().to_string()
            } else {
                "FAILED".to_string()
            };
            format!(
                "{mark} {} at {}: {} ({millis}ms)",
                outcome.chain, failure.step, failure.error
            )
        }
    }
}
