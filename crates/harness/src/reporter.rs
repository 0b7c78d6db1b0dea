//! Coverage reporting.
//!
//! Runs after the content server has stopped, so every upload is on disk.
//! [`SummaryReporter`] merges the istanbul-format files itself and writes a
//! JSON and a plain-text summary; [`CommandReporter`] hands both
//! directories to an external report tool.

use crate::result::{HarnessError, HarnessResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

/// Placeholder replaced with the coverage directory in command arguments
pub const COVERAGE_PLACEHOLDER: &str = "{coverage}";
/// Placeholder replaced with the reports directory in command arguments
pub const REPORTS_PLACEHOLDER: &str = "{reports}";

/// JSON summary file name
pub const SUMMARY_JSON: &str = "coverage-summary.json";
/// Text summary file name
pub const SUMMARY_TEXT: &str = "coverage-summary.txt";

/// What a report run produced
#[derive(Debug, Clone, Default)]
pub struct ReportOutcome {
    /// Coverage files consumed
    pub files_read: usize,
    /// Files written
    pub outputs: Vec<PathBuf>,
}

/// Turns a directory of coverage uploads into reports
#[async_trait]
pub trait Reporter: Send + Sync + fmt::Debug {
    /// Reporter name for logs
    fn name(&self) -> &str;

    /// Read `coverage_dir`, write into `reports_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if reports cannot be produced.
    async fn report(&self, coverage_dir: &Path, reports_dir: &Path) -> HarnessResult<ReportOutcome>;
}

// =============================================================================
// Coverage model
// =============================================================================

/// Istanbul coverage for one source file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileCoverage {
    /// Source path as the instrumenter recorded it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Statement hit counts
    #[serde(default)]
    pub s: BTreeMap<String, u64>,
    /// Function hit counts
    #[serde(default)]
    pub f: BTreeMap<String, u64>,
    /// Branch hit counts, one per branch arm
    #[serde(default)]
    pub b: BTreeMap<String, Vec<u64>>,
    /// Statement locations, used to derive line coverage
    #[serde(default, rename = "statementMap")]
    pub statement_map: BTreeMap<String, Value>,
}

impl FileCoverage {
    fn merge(&mut self, other: Self) {
        if self.path.is_none() {
            self.path = other.path;
        }
        for (id, hits) in other.s {
            *self.s.entry(id).or_default() += hits;
        }
        for (id, hits) in other.f {
            *self.f.entry(id).or_default() += hits;
        }
        for (id, arms) in other.b {
            let merged = self.b.entry(id).or_default();
            if merged.len() < arms.len() {
                merged.resize(arms.len(), 0);
            }
            for (slot, hits) in merged.iter_mut().zip(arms) {
                *slot += hits;
            }
        }
        for (id, location) in other.statement_map {
            self.statement_map.entry(id).or_insert(location);
        }
    }

    fn line_hits(&self) -> BTreeMap<u64, u64> {
        let mut lines = BTreeMap::new();
        for (id, hits) in &self.s {
            let line = self
                .statement_map
                .get(id)
                .and_then(|loc| loc.pointer("/start/line"))
                .and_then(Value::as_u64);
            if let Some(line) = line {
                let entry = lines.entry(line).or_insert(0);
                *entry = (*entry).max(*hits);
            }
        }
        lines
    }

    /// Totals for this file
    #[must_use]
    pub fn summary(&self) -> FileSummary {
        let lines = self.line_hits();
        FileSummary {
            lines: Metric::from_hits(lines.values().copied()),
            statements: Metric::from_hits(self.s.values().copied()),
            functions: Metric::from_hits(self.f.values().copied()),
            branches: Metric::from_hits(self.b.values().flatten().copied()),
        }
    }
}

/// Merged coverage across every upload, keyed by source file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageMap {
    files: BTreeMap<String, FileCoverage>,
}

impl CoverageMap {
    /// Empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of source files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when no file has coverage
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Coverage of one file
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileCoverage> {
        self.files.get(path)
    }

    /// Merge one upload (`{ "<file>": FileCoverage, ... }`)
    pub fn merge_value(&mut self, value: Value) -> HarnessResult<()> {
        let files: BTreeMap<String, FileCoverage> = match value {
            Value::Null => return Ok(()),
            other => serde_json::from_value(other)?,
        };
        for (path, coverage) in files {
            match self.files.get_mut(&path) {
                Some(existing) => existing.merge(coverage),
                None => {
                    self.files.insert(path, coverage);
                }
            }
        }
        Ok(())
    }

    /// Merge every `*.json` file in `dir`, in name order.
    ///
    /// Unreadable or malformed files are logged and skipped. Returns the
    /// number of files merged.
    pub async fn load_dir(&mut self, dir: &Path) -> HarnessResult<usize> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                names.push(path);
            }
        }
        names.sort();

        let mut merged = 0;
        for path in names {
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(HarnessError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<Value>(&bytes)?))
                .and_then(|value| self.merge_value(value));
            match parsed {
                Ok(()) => {
                    debug!(file = %path.display(), "merged coverage file");
                    merged += 1;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "skipping coverage file"),
            }
        }
        Ok(merged)
    }

    /// Summary for every file plus the total
    #[must_use]
    pub fn summary(&self) -> CoverageSummary {
        let files: BTreeMap<String, FileSummary> = self
            .files
            .iter()
            .map(|(path, coverage)| (path.clone(), coverage.summary()))
            .collect();
        let total = files.values().fold(FileSummary::default(), |acc, s| acc.add(s));
        CoverageSummary { total, files }
    }
}

// =============================================================================
// Summary
// =============================================================================

/// Covered/total counts for one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Items instrumented
    pub total: u64,
    /// Items hit at least once
    pub covered: u64,
    /// Items excluded from coverage
    pub skipped: u64,
    /// Covered percentage, 100 when there is nothing to cover
    pub pct: f64,
}

impl Metric {
    fn new(total: u64, covered: u64) -> Self {
        let pct = if total == 0 {
            100.0
        } else {
            ((covered as f64 / total as f64) * 10_000.0).round() / 100.0
        };
        Self {
            total,
            covered,
            skipped: 0,
            pct,
        }
    }

    fn from_hits(hits: impl Iterator<Item = u64>) -> Self {
        let (total, covered) = hits.fold((0, 0), |(t, c), h| (t + 1, c + u64::from(h > 0)));
        Self::new(total, covered)
    }

    fn add(self, other: Self) -> Self {
        Self::new(self.total + other.total, self.covered + other.covered)
    }
}

/// Per-file metrics in istanbul's `json-summary` shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    /// Line coverage
    pub lines: Metric,
    /// Statement coverage
    pub statements: Metric,
    /// Function coverage
    pub functions: Metric,
    /// Branch coverage
    pub branches: Metric,
}

impl FileSummary {
    fn add(self, other: &Self) -> Self {
        Self {
            lines: self.lines.add(other.lines),
            statements: self.statements.add(other.statements),
            functions: self.functions.add(other.functions),
            branches: self.branches.add(other.branches),
        }
    }
}

/// Totals and per-file metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageSummary {
    /// Sum over every file
    pub total: FileSummary,
    /// Per file, by path
    pub files: BTreeMap<String, FileSummary>,
}

impl CoverageSummary {
    /// JSON object with a `total` key followed by one key per file
    pub fn to_json_pretty(&self) -> HarnessResult<String> {
        let mut object = serde_json::Map::new();
        object.insert("total".to_string(), serde_json::to_value(self.total)?);
        for (path, summary) in &self.files {
            object.insert(path.clone(), serde_json::to_value(summary)?);
        }
        Ok(serde_json::to_string_pretty(&Value::Object(object))?)
    }

    /// Fixed-width text table
    #[must_use]
    pub fn to_text(&self) -> String {
        let width = self
            .files
            .keys()
            .map(String::len)
            .chain(std::iter::once("All files".len()))
            .max()
            .unwrap_or_default();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<width$} | % Stmts | % Branch | % Funcs | % Lines",
            "File"
        );
        let _ = writeln!(out, "{}", "-".repeat(width + 42));
        let mut row = |name: &str, s: &FileSummary| {
            let _ = writeln!(
                out,
                "{name:<width$} | {:>7.2} | {:>8.2} | {:>7.2} | {:>7.2}",
                s.statements.pct, s.branches.pct, s.functions.pct, s.lines.pct
            );
        };
        row("All files", &self.total);
        for (path, summary) in &self.files {
            row(path, summary);
        }
        out
    }
}

// =============================================================================
// Reporters
// =============================================================================

/// Writes `coverage-summary.json` and `coverage-summary.txt`
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryReporter;

#[async_trait]
impl Reporter for SummaryReporter {
    fn name(&self) -> &str {
        "summary"
    }

    async fn report(&self, coverage_dir: &Path, reports_dir: &Path) -> HarnessResult<ReportOutcome> {
        let mut map = CoverageMap::new();
        let files_read = map
            .load_dir(coverage_dir)
            .await
            .map_err(|e| HarnessError::report(format!("cannot read {}: {e}", coverage_dir.display())))?;
        if files_read == 0 {
            warn!(dir = %coverage_dir.display(), "no coverage files found");
        }

        let summary = map.summary();
        tokio::fs::create_dir_all(reports_dir).await?;
        let json_path = reports_dir.join(SUMMARY_JSON);
        let text_path = reports_dir.join(SUMMARY_TEXT);
        tokio::fs::write(&json_path, summary.to_json_pretty()?).await?;
        tokio::fs::write(&text_path, summary.to_text()).await?;

        info!(
            files_read,
            sources = map.len(),
            statements_pct = summary.total.statements.pct,
            reports = %reports_dir.display(),
            "coverage summary written"
        );
        Ok(ReportOutcome {
            files_read,
            outputs: vec![json_path, text_path],
        })
    }
}

/// Runs an external report tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReporter {
    /// Program to run
    pub program: String,
    /// Arguments, with `{coverage}` and `{reports}` substituted
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandReporter {
    /// Reporter running `program args...`
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Arguments with placeholders substituted
    #[must_use]
    pub fn command_args(&self, coverage_dir: &Path, reports_dir: &Path) -> Vec<String> {
        let coverage = coverage_dir.to_string_lossy();
        let reports = reports_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(COVERAGE_PLACEHOLDER, &coverage)
                    .replace(REPORTS_PLACEHOLDER, &reports)
            })
            .collect()
    }
}

#[async_trait]
impl Reporter for CommandReporter {
    fn name(&self) -> &str {
        &self.program
    }

    async fn report(&self, coverage_dir: &Path, reports_dir: &Path) -> HarnessResult<ReportOutcome> {
        tokio::fs::create_dir_all(reports_dir).await?;
        let args = self.command_args(coverage_dir, reports_dir);
        debug!(program = %self.program, ?args, "running report command");

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HarnessError::report(format!("cannot run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::report(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        info!(program = %self.program, reports = %reports_dir.display(), "report command finished");
        Ok(ReportOutcome {
            files_read: 0,
            outputs: vec![reports_dir.to_path_buf()],
        })
    }
}
