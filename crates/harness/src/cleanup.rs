//! Ordered directory cleanup.
//!
//! Cleanups run strictly in declaration order so an entry may rely on an
//! earlier one having freed its path. Removal problems are logged and
//! absorbed; only a path that cannot be resolved at all fails a stage.

use crate::paths::PathResolver;
use crate::result::{HarnessError, HarnessResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name pattern of runner scratch directories left in the temp root
pub const DEFAULT_SCRATCH_PATTERN: &str = "^testem-";

/// One directory to remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupDefinition {
    /// Label used in logs
    pub name: String,
    /// Path in any form the resolver accepts
    pub path: String,
    /// Also sweep leftover runner scratch directories from the temp root
    #[serde(default, alias = "isTestemContent")]
    pub is_testem_content: bool,
}

impl CleanupDefinition {
    /// Plain directory removal
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_testem_content: false,
        }
    }

    /// Removal that also sweeps runner scratch directories
    #[must_use]
    pub fn testem_content(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            is_testem_content: true,
            ..Self::new(name, path)
        }
    }
}

/// When a cleanup list runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupStage {
    /// Before fixtures are constructed
    Initial,
    /// After fixtures are stopped and reports written
    Final,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::Final => write!(f, "Final"),
        }
    }
}

/// Cleanup lists for both stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPlan {
    /// Run before startup
    #[serde(default)]
    pub initial: Vec<CleanupDefinition>,
    /// Run at the end of shutdown
    #[serde(default, rename = "final")]
    pub final_stage: Vec<CleanupDefinition>,
}

impl CleanupPlan {
    /// The list for one stage
    #[must_use]
    pub fn for_stage(&self, stage: CleanupStage) -> &[CleanupDefinition] {
        match stage {
            CleanupStage::Initial => &self.initial,
            CleanupStage::Final => &self.final_stage,
        }
    }
}

/// What a stage did
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Paths removed
    pub removed: Vec<PathBuf>,
    /// Paths that did not exist
    pub skipped: Vec<PathBuf>,
    /// Paths that could not be removed, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

/// Runs cleanup lists
#[derive(Debug, Clone)]
pub struct CleanupSequencer {
    resolver: PathResolver,
    temp_root: PathBuf,
    scratch_pattern: Regex,
}

impl CleanupSequencer {
    /// Sequencer sweeping the system temp directory
    pub fn new(resolver: PathResolver) -> HarnessResult<Self> {
        Ok(Self {
            resolver,
            temp_root: std::env::temp_dir(),
            scratch_pattern: compile_pattern(DEFAULT_SCRATCH_PATTERN)?,
        })
    }

    /// Sweep a different temp root
    #[must_use]
    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    /// Match scratch directories with a different pattern
    pub fn with_scratch_pattern(mut self, pattern: &str) -> HarnessResult<Self> {
        self.scratch_pattern = compile_pattern(pattern)?;
        Ok(self)
    }

    /// Run one stage's definitions in order.
    ///
    /// # Errors
    ///
    /// Fails only when a definition's path cannot be resolved; removal
    /// failures are recorded in the report instead.
    pub async fn run(
        &self,
        stage: CleanupStage,
        defs: &[CleanupDefinition],
    ) -> HarnessResult<CleanupReport> {
        info!(stage = %stage, count = defs.len(), "running cleanup");
        let mut report = CleanupReport::default();

        for def in defs {
            let path = self.resolver.resolve(&def.path)?;
            self.remove(stage, &def.name, &path, &mut report).await;
            if def.is_testem_content {
                self.sweep_scratch(stage, &mut report).await;
            }
        }

        info!(
            stage = %stage,
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "cleanup finished"
        );
        Ok(report)
    }

    async fn remove(&self, stage: CleanupStage, name: &str, path: &Path, report: &mut CleanupReport) {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(stage = %stage, cleanup = name, path = %path.display(), "nothing to remove");
                report.skipped.push(path.to_path_buf());
                return;
            }
            Err(e) => {
                warn!(stage = %stage, cleanup = name, path = %path.display(), error = %e, "cannot inspect path");
                report.failed.push((path.to_path_buf(), e.to_string()));
                return;
            }
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };

        match result {
            Ok(()) => {
                debug!(stage = %stage, cleanup = name, path = %path.display(), "removed");
                report.removed.push(path.to_path_buf());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.skipped.push(path.to_path_buf());
            }
            Err(e) => {
                warn!(stage = %stage, cleanup = name, path = %path.display(), error = %e, "removal failed, continuing");
                report.failed.push((path.to_path_buf(), e.to_string()));
            }
        }
    }

    async fn sweep_scratch(&self, stage: CleanupStage, report: &mut CleanupReport) {
        let mut entries = match tokio::fs::read_dir(&self.temp_root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(stage = %stage, temp_root = %self.temp_root.display(), error = %e, "cannot scan temp root");
                return;
            }
        };

        let mut matches = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
                    if is_dir && self.scratch_pattern.is_match(&name) {
                        matches.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(stage = %stage, error = %e, "error while scanning temp root");
                    break;
                }
            }
        }

        matches.sort();
        for path in matches {
            self.remove(stage, "runner scratch", &path, report).await;
        }
    }
}

fn compile_pattern(pattern: &str) -> HarnessResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| HarnessError::config(format!("invalid scratch pattern '{pattern}': {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sequencer(base: &Path, temp_root: &Path) -> CleanupSequencer {
        CleanupSequencer::new(PathResolver::new(base).with_package("pkg", base))
            .unwrap()
            .with_temp_root(temp_root)
    }

    #[tokio::test]
    async fn test_missing_directory_is_success() {
        let dir = TempDir::new().unwrap();
        let report = sequencer(dir.path(), dir.path())
            .run(
                CleanupStage::Initial,
                &[CleanupDefinition::new("coverage", "does/not/exist")],
            )
            .await
            .unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert!(report.removed.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_removes_in_order() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("outer/inner");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("file.json"), "{}").unwrap();

        let report = sequencer(dir.path(), dir.path())
            .run(
                CleanupStage::Final,
                &[
                    CleanupDefinition::new("inner", "%pkg/outer/inner"),
                    CleanupDefinition::new("outer", "outer"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            report.removed,
            vec![dir.path().join("outer/inner"), dir.path().join("outer")]
        );
        assert!(!dir.path().join("outer").exists());
    }

    #[tokio::test]
    async fn test_testem_content_sweeps_scratch_dirs() {
        let base = TempDir::new().unwrap();
        let temp_root = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_root.path().join("testem-1234-abc")).unwrap();
        std::fs::create_dir_all(temp_root.path().join("testem-5678")).unwrap();
        std::fs::create_dir_all(temp_root.path().join("unrelated")).unwrap();
        std::fs::write(temp_root.path().join("testem-file"), "x").unwrap();
        std::fs::create_dir_all(base.path().join("testem")).unwrap();

        let report = sequencer(base.path(), temp_root.path())
            .run(
                CleanupStage::Final,
                &[CleanupDefinition::testem_content("testem", "testem")],
            )
            .await
            .unwrap();

        assert_eq!(report.removed.len(), 3);
        assert!(!temp_root.path().join("testem-1234-abc").exists());
        assert!(!temp_root.path().join("testem-5678").exists());
        assert!(temp_root.path().join("unrelated").exists());
        assert!(temp_root.path().join("testem-file").exists());
    }

    #[tokio::test]
    async fn test_removal_failure_is_recorded_and_stage_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), "plain file").unwrap();
        std::fs::create_dir_all(dir.path().join("second/nested")).unwrap();

        let report = sequencer(dir.path(), dir.path())
            .run(
                CleanupStage::Final,
                &[
                    CleanupDefinition::new("first", "blocker/inner"),
                    CleanupDefinition::new("second", "second"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, dir.path().join("blocker/inner"));
        assert!(!report.failed[0].1.is_empty());
        assert_eq!(report.removed, vec![dir.path().join("second")]);
        assert!(!dir.path().join("second").exists());
        assert!(dir.path().join("blocker").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permission_denied_removal_is_absorbed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir_all(locked.join("child")).unwrap();
        std::fs::create_dir_all(dir.path().join("after")).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        let report = sequencer(dir.path(), dir.path())
            .run(
                CleanupStage::Final,
                &[
                    CleanupDefinition::new("child", "locked/child"),
                    CleanupDefinition::new("after", "after"),
                ],
            )
            .await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let report = report.unwrap();
        assert!(report.removed.contains(&dir.path().join("after")));
        // Privileged users bypass the mode bits and remove the child anyway.
        let child_left = locked.join("child").exists();
        assert_eq!(child_left, report.failed.len() == 1);
    }

    #[tokio::test]
    async fn test_unresolvable_path_fails_stage() {
        let dir = TempDir::new().unwrap();
        let err = sequencer(dir.path(), dir.path())
            .run(
                CleanupStage::Initial,
                &[CleanupDefinition::new("bad", "%unknown-package/coverage")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnknownPackage { .. }));
    }

    #[tokio::test]
    async fn test_removes_plain_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stale.json"), "{}").unwrap();
        let report = sequencer(dir.path(), dir.path())
            .run(CleanupStage::Initial, &[CleanupDefinition::new("stale", "stale.json")])
            .await
            .unwrap();
        assert_eq!(report.removed.len(), 1);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = CleanupSequencer::new(PathResolver::new("/"))
            .unwrap()
            .with_scratch_pattern("(")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config { .. }));
    }

    #[test]
    fn test_plan_deserializes_final_key() {
        let plan: CleanupPlan = serde_json::from_str(
            r#"{"initial":[{"name":"a","path":"x"}],"final":[{"name":"b","path":"y","isTestemContent":true}]}"#,
        )
        .unwrap();
        assert_eq!(plan.for_stage(CleanupStage::Initial).len(), 1);
        assert!(plan.for_stage(CleanupStage::Final)[0].is_testem_content);
    }
}
