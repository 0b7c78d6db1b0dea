//! Source instrumentation.
//!
//! Each configured source directory is instrumented into its own subtree
//! of the instrumented-source directory, `<instrumented>/<segment>`. Runs
//! are strictly sequential so a failure is attributed to one directory,
//! and the first failure aborts the rest: a run with partially
//! instrumented sources would report misleading coverage.

use crate::proxy::ResolvedDirectory;
use crate::result::{HarnessError, HarnessResult};
use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tracing::{debug, info};

/// Placeholder replaced with the source directory in command arguments
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced with the destination directory in command arguments
pub const DESTINATION_PLACEHOLDER: &str = "{destination}";

/// Options passed to every instrumentation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentOptions {
    /// Glob patterns, relative to the source directory, left out of the copy
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl InstrumentOptions {
    /// Compile the exclude patterns
    pub fn exclude_patterns(&self) -> HarnessResult<Vec<Pattern>> {
        self.excludes
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| HarnessError::config(format!("invalid exclude pattern '{p}': {e}")))
            })
            .collect()
    }
}

/// Transforms a source tree into an instrumented copy
#[async_trait]
pub trait Instrumenter: Send + Sync + fmt::Debug {
    /// Tool name for logs
    fn name(&self) -> &str;

    /// Instrument `source` into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read, transformed or written.
    async fn instrument(
        &self,
        source: &Path,
        destination: &Path,
        options: &InstrumentOptions,
    ) -> HarnessResult<()>;
}

/// Instrument every source directory, one after another.
///
/// Returns the destination directories in order.
///
/// # Errors
///
/// The first failure aborts the remaining directories and is reported as
/// [`HarnessError::Instrumentation`] naming the failing directory.
pub async fn instrument_all(
    instrumenter: &dyn Instrumenter,
    sources: &[ResolvedDirectory],
    destination_root: &Path,
    options: &InstrumentOptions,
) -> HarnessResult<Vec<PathBuf>> {
    let mut outputs = Vec::with_capacity(sources.len());
    for dir in sources {
        let destination = destination_root.join(&dir.segment);
        let started = Instant::now();
        info!(
            tool = instrumenter.name(),
            directory = %dir.key,
            source = %dir.path.display(),
            destination = %destination.display(),
            "instrumenting"
        );

        if !tokio::fs::try_exists(&dir.path).await.unwrap_or(false) {
            return Err(HarnessError::instrumentation(
                &dir.key,
                format!("source directory {} does not exist", dir.path.display()),
            ));
        }

        instrumenter
            .instrument(&dir.path, &destination, options)
            .await
            .map_err(|e| match e {
                HarnessError::Instrumentation { .. } => e,
                other => HarnessError::instrumentation(&dir.key, other.to_string()),
            })?;

        debug!(
            directory = %dir.key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "instrumented"
        );
        outputs.push(destination);
    }
    Ok(outputs)
}

/// Copies a tree verbatim, honouring excludes.
///
/// Used when sources are already instrumented or when no external tool is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyInstrumenter;

#[async_trait]
impl Instrumenter for CopyInstrumenter {
    fn name(&self) -> &str {
        "copy"
    }

    async fn instrument(
        &self,
        source: &Path,
        destination: &Path,
        options: &InstrumentOptions,
    ) -> HarnessResult<()> {
        let excludes = options.exclude_patterns()?;
        let mut pending = vec![PathBuf::new()];
        tokio::fs::create_dir_all(destination).await?;

        while let Some(relative) = pending.pop() {
            let mut entries = tokio::fs::read_dir(source.join(&relative)).await?;
            while let Some(entry) = entries.next_entry().await? {
                let child = relative.join(entry.file_name());
                if is_excluded(&excludes, &child) {
                    debug!(path = %child.display(), "excluded from instrumentation");
                    continue;
                }
                let target = destination.join(&child);
                if entry.file_type().await?.is_dir() {
                    tokio::fs::create_dir_all(&target).await?;
                    pending.push(child);
                } else {
                    let _ = tokio::fs::copy(entry.path(), &target).await?;
                }
            }
        }
        Ok(())
    }
}

fn is_excluded(patterns: &[Pattern], relative: &Path) -> bool {
    let unix = relative.to_string_lossy().replace('\\', "/");
    patterns.iter().any(|p| p.matches(&unix))
}

/// Runs an external instrumentation tool, e.g.
/// `nyc instrument {source} {destination}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInstrumenter {
    /// Executable
    pub program: String,
    /// Arguments; `{source}` and `{destination}` are substituted
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag preceding each exclude pattern, e.g. `--exclude`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_flag: Option<String>,
}

impl CommandInstrumenter {
    /// Command with the given program and arguments
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            exclude_flag: None,
        }
    }

    /// Pass each exclude pattern after `flag`
    #[must_use]
    pub fn with_exclude_flag(mut self, flag: impl Into<String>) -> Self {
        self.exclude_flag = Some(flag.into());
        self
    }

    /// Arguments after placeholder substitution
    #[must_use]
    pub fn command_args(
        &self,
        source: &Path,
        destination: &Path,
        options: &InstrumentOptions,
    ) -> Vec<String> {
        let source = source.display().to_string();
        let destination = destination.display().to_string();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(DESTINATION_PLACEHOLDER, &destination)
            })
            .collect();
        if let Some(flag) = &self.exclude_flag {
            for pattern in &options.excludes {
                args.push(flag.clone());
                args.push(pattern.clone());
            }
        }
        args
    }
}

#[async_trait]
impl Instrumenter for CommandInstrumenter {
    fn name(&self) -> &str {
        &self.program
    }

    async fn instrument(
        &self,
        source: &Path,
        destination: &Path,
        options: &InstrumentOptions,
    ) -> HarnessResult<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let args = self.command_args(source, destination, options);
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HarnessError::Instrumentation {
                directory: source.display().to_string(),
                message: format!("failed to execute {}: {e}", self.program),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("no output");
            Err(HarnessError::Instrumentation {
                directory: source.display().to_string(),
                message: format!(
                    "{} exited with {:?}: {detail}",
                    self.program,
                    output.status.code()
                ),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn resolved(key: &str, path: PathBuf) -> ResolvedDirectory {
        let segment = path.file_name().unwrap().to_string_lossy().into_owned();
        ResolvedDirectory {
            key: key.to_string(),
            path,
            segment,
        }
    }

    #[derive(Debug, Default)]
    struct ScriptedInstrumenter {
        fail_on: Option<String>,
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Instrumenter for ScriptedInstrumenter {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn instrument(
            &self,
            source: &Path,
            _destination: &Path,
            _options: &InstrumentOptions,
        ) -> HarnessResult<()> {
            self.calls.lock().unwrap().push(source.to_path_buf());
            match &self.fail_on {
                Some(name) if source.ends_with(name) => Err(HarnessError::config("syntax error")),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_copy_instrumenter_copies_tree_with_excludes() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("lib/nested")).unwrap();
        std::fs::write(src.path().join("lib/nested/a.js"), "var a = 1;").unwrap();
        std::fs::write(src.path().join("lib/b.js"), "var b = 2;").unwrap();
        std::fs::create_dir_all(src.path().join("lib/vendor")).unwrap();
        std::fs::write(src.path().join("lib/vendor/c.js"), "var c;").unwrap();

        let options = InstrumentOptions {
            excludes: vec!["vendor".to_string()],
        };
        let dirs = vec![resolved("lib", src.path().join("lib"))];
        let outputs = instrument_all(&CopyInstrumenter, &dirs, out.path(), &options)
            .await
            .unwrap();

        assert_eq!(outputs, vec![out.path().join("lib")]);
        assert_eq!(
            std::fs::read_to_string(out.path().join("lib/nested/a.js")).unwrap(),
            "var a = 1;"
        );
        assert!(out.path().join("lib/b.js").exists());
        assert!(!out.path().join("lib/vendor").exists());
    }

    #[tokio::test]
    async fn test_failure_aborts_and_names_directory() {
        let root = TempDir::new().unwrap();
        for name in ["first", "second", "third"] {
            std::fs::create_dir_all(root.path().join(name)).unwrap();
        }
        let dirs = vec![
            resolved("firstDir", root.path().join("first")),
            resolved("secondDir", root.path().join("second")),
            resolved("thirdDir", root.path().join("third")),
        ];
        let instrumenter = ScriptedInstrumenter {
            fail_on: Some("second".to_string()),
            ..Default::default()
        };

        let err = instrument_all(&instrumenter, &dirs, root.path(), &InstrumentOptions::default())
            .await
            .unwrap_err();
        match err {
            HarnessError::Instrumentation { directory, .. } => assert_eq!(directory, "secondDir"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(instrumenter.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_is_instrumentation_error() {
        let root = TempDir::new().unwrap();
        let dirs = vec![resolved("ghost", root.path().join("ghost"))];
        let err = instrument_all(&CopyInstrumenter, &dirs, root.path(), &InstrumentOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_command_args_substitution() {
        let cmd = CommandInstrumenter::new(
            "nyc",
            vec![
                "instrument".to_string(),
                SOURCE_PLACEHOLDER.to_string(),
                DESTINATION_PLACEHOLDER.to_string(),
            ],
        )
        .with_exclude_flag("--exclude");
        let options = InstrumentOptions {
            excludes: vec!["**/*.min.js".to_string()],
        };
        let args = cmd.command_args(Path::new("/src"), Path::new("/out/src"), &options);
        assert_eq!(
            args,
            vec!["instrument", "/src", "/out/src", "--exclude", "**/*.min.js"]
        );
    }

    #[tokio::test]
    async fn test_command_instrumenter_missing_program() {
        let root = TempDir::new().unwrap();
        let cmd = CommandInstrumenter::new("definitely-not-an-instrumenter-binary", Vec::new());
        let err = cmd
            .instrument(root.path(), &root.path().join("out"), &InstrumentOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to execute"));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let options = InstrumentOptions {
            excludes: vec!["[".to_string()],
        };
        assert!(options.exclude_patterns().is_err());
    }
}
