//! Harness configuration.
//!
//! A [`HarnessConfig`] is read from JSON or YAML (by file extension) or
//! assembled with [`HarnessConfig::builder`]. Every directory setting
//! accepts the `%package/...`, relative and absolute forms understood by
//! [`PathResolver`]; [`HarnessConfig::layout`] turns them into concrete
//! directories, generating names for the ones left unset.

use crate::cleanup::{CleanupDefinition, CleanupPlan, DEFAULT_SCRATCH_PATTERN};
use crate::coverage::{DEFAULT_COVERAGE_PATH, DEFAULT_MAX_UPLOAD_BYTES};
use crate::event::DEFAULT_WRAPPED_EVENT_TIMEOUT_MS;
use crate::instrument::{CommandInstrumenter, CopyInstrumenter, InstrumentOptions, Instrumenter};
use crate::paths::{unique_dir_name, PathResolver};
use crate::proxy::DirectoryDefinition;
use crate::reporter::{CommandReporter, Reporter, SummaryReporter};
use crate::result::{HarnessError, HarnessResult};
use crate::server::DEFAULT_COVERAGE_PORT;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Directory maps
// =============================================================================

/// Directory definitions keyed by name, in declaration order.
///
/// Serialized as a map; each value is either a path string or an object
/// `{ filePath, priority?, mount? }`. The map key becomes the definition key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryMap(Vec<DirectoryDefinition>);

impl DirectoryMap {
    /// Empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a definition; an existing key is replaced in place
    pub fn insert(&mut self, def: DirectoryDefinition) {
        if let Some(slot) = self.0.iter_mut().find(|d| d.key == def.key) {
            *slot = def;
        } else {
            self.0.push(def);
        }
    }

    /// Definitions in order
    #[must_use]
    pub fn definitions(&self) -> &[DirectoryDefinition] {
        &self.0
    }

    /// Number of definitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<DirectoryDefinition>> for DirectoryMap {
    fn from(defs: Vec<DirectoryDefinition>) -> Self {
        let mut map = Self::new();
        for def in defs {
            map.insert(def);
        }
        map
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DirectoryValue {
    Path(String),
    Definition(DirectoryDefinition),
}

impl<'de> Deserialize<'de> for DirectoryMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = DirectoryMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of directory names to paths or definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = DirectoryMap::new();
                while let Some((key, value)) = access.next_entry::<String, DirectoryValue>()? {
                    let mut def = match value {
                        DirectoryValue::Path(path) => DirectoryDefinition::new(key.clone(), path),
                        DirectoryValue::Definition(def) => def,
                    };
                    def.key = key;
                    map.insert(def);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

impl Serialize for DirectoryMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for def in &self.0 {
            map.serialize_entry(&def.key, def)?;
        }
        map.end()
    }
}

// =============================================================================
// Instrumentation and reporting settings
// =============================================================================

/// How sources are instrumented
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstrumentSetting {
    /// `true` stages a verbatim copy, `false` serves sources directly
    Enabled(bool),
    /// External instrumenter
    Command {
        /// Program to run
        command: String,
        /// Arguments with `{source}`/`{destination}` placeholders
        #[serde(default)]
        args: Vec<String>,
        /// Flag repeated before each exclude pattern
        #[serde(default, alias = "excludeFlag")]
        exclude_flag: Option<String>,
    },
}

impl Default for InstrumentSetting {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

impl InstrumentSetting {
    /// The instrumenter to use, `None` when disabled
    #[must_use]
    pub fn instrumenter(&self) -> Option<Arc<dyn Instrumenter>> {
        match self {
            Self::Enabled(false) => None,
            Self::Enabled(true) => Some(Arc::new(CopyInstrumenter)),
            Self::Command {
                command,
                args,
                exclude_flag,
            } => {
                let mut tool = CommandInstrumenter::new(command.clone(), args.clone());
                if let Some(flag) = exclude_flag {
                    tool = tool.with_exclude_flag(flag.clone());
                }
                Some(Arc::new(tool))
            }
        }
    }
}

/// Built-in report choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinReport {
    /// No report step
    None,
    /// [`SummaryReporter`]
    Summary,
}

/// Which reporter runs after shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportSetting {
    /// `"none"` or `"summary"`
    Builtin(BuiltinReport),
    /// External report tool
    Command(CommandReporter),
}

impl Default for ReportSetting {
    fn default() -> Self {
        Self::Builtin(BuiltinReport::Summary)
    }
}

impl ReportSetting {
    /// The reporter to use, `None` when reporting is off
    #[must_use]
    pub fn reporter(&self) -> Option<Arc<dyn Reporter>> {
        match self {
            Self::Builtin(BuiltinReport::None) => None,
            Self::Builtin(BuiltinReport::Summary) => Some(Arc::new(SummaryReporter)),
            Self::Command(command) => Some(Arc::new(command.clone())),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Everything the orchestrator needs to know
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root for relative paths; the working directory when unset
    pub base_dir: Option<PathBuf>,
    /// Package roots for `%name/...` paths
    pub packages: BTreeMap<String, PathBuf>,
    /// Interface the content server binds
    pub coverage_host: IpAddr,
    /// Port the content server binds; 0 picks one
    pub coverage_port: u16,
    /// URL path of the coverage receiver
    pub coverage_path: String,
    /// Where uploads are written
    pub coverage_dir: Option<String>,
    /// Where instrumented sources are staged
    pub instrumented_source_dir: Option<String>,
    /// Runner working directory
    pub testem_dir: Option<String>,
    /// Where reports are written
    pub reports_dir: Option<String>,
    /// Cleanup lists; a default plan is derived when unset
    pub cleanup: Option<CleanupPlan>,
    /// How long a chain waits for a secondary event
    pub wrapped_event_timeout_ms: u64,
    /// Directories that get instrumented
    pub source_dirs: DirectoryMap,
    /// Directories served verbatim
    pub content_dirs: DirectoryMap,
    /// Extra literal proxy paths
    pub additional_proxies: Vec<String>,
    /// Instrumentation setting
    pub instrument: InstrumentSetting,
    /// Globs left out of instrumentation
    pub instrument_excludes: Vec<String>,
    /// Reporter setting
    pub report: ReportSetting,
    /// Content server instance id; generated when unset
    pub instance_id: Option<String>,
    /// Directory swept for runner scratch space; system temp when unset
    pub temp_root: Option<PathBuf>,
    /// Regex naming runner scratch directories
    pub testem_scratch_pattern: String,
    /// Coverage upload size limit
    pub max_upload_bytes: usize,
    /// Answer cross-origin requests
    pub cors: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            packages: BTreeMap::new(),
            coverage_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            coverage_port: DEFAULT_COVERAGE_PORT,
            coverage_path: DEFAULT_COVERAGE_PATH.to_string(),
            coverage_dir: None,
            instrumented_source_dir: None,
            testem_dir: None,
            reports_dir: None,
            cleanup: None,
            wrapped_event_timeout_ms: DEFAULT_WRAPPED_EVENT_TIMEOUT_MS,
            source_dirs: DirectoryMap::new(),
            content_dirs: DirectoryMap::new(),
            additional_proxies: Vec::new(),
            instrument: InstrumentSetting::default(),
            instrument_excludes: Vec::new(),
            report: ReportSetting::default(),
            instance_id: None,
            temp_root: None,
            testem_scratch_pattern: DEFAULT_SCRATCH_PATTERN.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            cors: true,
        }
    }
}

/// Concrete directories for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    /// Content server instance id
    pub instance_id: String,
    /// Coverage upload directory
    pub coverage_dir: PathBuf,
    /// Instrumented source directory
    pub instrumented_dir: PathBuf,
    /// Runner working directory
    pub testem_dir: PathBuf,
    /// Report output directory
    pub reports_dir: PathBuf,
    /// Temp root swept for scratch directories
    pub temp_root: PathBuf,
    /// Cleanup lists with every generated directory filled in
    pub cleanup: CleanupPlan,
}

impl HarnessConfig {
    /// Builder starting from defaults
    #[must_use]
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Read a configuration file; `.yaml`/`.yml` are YAML, anything else JSON
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::config(format!("cannot read {}: {e}", path.display())))?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        let config = if is_yaml {
            Self::from_yaml_str(&text)?
        } else {
            Self::from_json_str(&text)?
        };
        Ok(config)
    }

    /// Parse and validate JSON
    pub fn from_json_str(text: &str) -> HarnessResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(text: &str) -> HarnessResult<Self> {
        let config: Self = serde_yaml_ng::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that would otherwise fail mid-run
    pub fn validate(&self) -> HarnessResult<()> {
        if !self.coverage_path.starts_with('/') || self.coverage_path.len() < 2 {
            return Err(HarnessError::config(format!(
                "coverage_path '{}' must start with '/'",
                self.coverage_path
            )));
        }
        if self.wrapped_event_timeout_ms == 0 {
            return Err(HarnessError::config("wrapped_event_timeout_ms must be positive"));
        }
        if self.max_upload_bytes == 0 {
            return Err(HarnessError::config("max_upload_bytes must be positive"));
        }
        Regex::new(&self.testem_scratch_pattern).map_err(|e| {
            HarnessError::config(format!(
                "invalid testem_scratch_pattern '{}': {e}",
                self.testem_scratch_pattern
            ))
        })?;
        for def in self
            .source_dirs
            .definitions()
            .iter()
            .chain(self.content_dirs.definitions())
        {
            if def.key.is_empty() || def.file_path.is_empty() {
                return Err(HarnessError::config(format!(
                    "directory definition '{}' needs a key and a filePath",
                    def.key
                )));
            }
        }
        for path in &self.additional_proxies {
            if !path.starts_with('/') {
                return Err(HarnessError::config(format!(
                    "additional proxy '{path}' must start with '/'"
                )));
            }
        }
        self.instrument_options().exclude_patterns()?;
        Ok(())
    }

    /// Path resolver for this configuration's base directory and packages
    pub fn resolver(&self) -> HarnessResult<PathResolver> {
        let base = match &self.base_dir {
            Some(dir) => PathResolver::from_current_dir()?.absolute(dir),
            None => std::env::current_dir()?,
        };
        Ok(self
            .packages
            .iter()
            .fold(PathResolver::new(base), |resolver, (name, root)| {
                resolver.with_package(name.clone(), root)
            }))
    }

    /// Secondary event timeout
    #[must_use]
    pub fn wrapped_event_timeout(&self) -> Duration {
        Duration::from_millis(self.wrapped_event_timeout_ms)
    }

    /// Options handed to the instrumenter
    #[must_use]
    pub fn instrument_options(&self) -> InstrumentOptions {
        InstrumentOptions {
            excludes: self.instrument_excludes.clone(),
        }
    }

    /// Resolve every directory for one run.
    ///
    /// Unset directories are generated as `<prefix>-<timestamp>-<instance>`:
    /// coverage, instrumented and testem directories under the temp root,
    /// reports under `<base>/reports`. With no explicit cleanup plan the
    /// initial stage removes the instrumented and testem directories and
    /// the final stage additionally removes the coverage directory. The
    /// reports directory is never cleaned.
    pub fn layout(&self, resolver: &PathResolver) -> HarnessResult<RunLayout> {
        let instance_id = self
            .instance_id
            .clone()
            .unwrap_or_else(generate_instance_id);
        let suffix = format!("{}-{instance_id}", chrono::Utc::now().timestamp_millis());
        let temp_root = self
            .temp_root
            .as_deref()
            .map_or_else(std::env::temp_dir, |dir| resolver.absolute(dir));

        let pick = |configured: &Option<String>, base: &Path, prefix: &str| -> HarnessResult<PathBuf> {
            match configured {
                Some(path) => resolver.resolve(path),
                None => Ok(unique_dir_name(base, prefix, &suffix)),
            }
        };
        let coverage_dir = pick(&self.coverage_dir, &temp_root, GENERATED_COVERAGE_PREFIX)?;
        let instrumented_dir = pick(
            &self.instrumented_source_dir,
            &temp_root,
            GENERATED_INSTRUMENTED_PREFIX,
        )?;
        let testem_dir = pick(&self.testem_dir, &temp_root, GENERATED_TESTEM_PREFIX)?;
        let reports_dir = pick(&self.reports_dir, &resolver.base_dir().join("reports"), "coverage")?;

        let cleanup = self.cleanup.clone().unwrap_or_else(|| {
            let entry = |name: &str, path: &Path| CleanupDefinition::new(name, path.to_string_lossy());
            let testem = CleanupDefinition::testem_content("testem", testem_dir.to_string_lossy());
            CleanupPlan {
                initial: vec![entry("instrumented", &instrumented_dir), testem.clone()],
                final_stage: vec![
                    entry("coverage", &coverage_dir),
                    entry("instrumented", &instrumented_dir),
                    testem,
                ],
            }
        });

        Ok(RunLayout {
            instance_id,
            coverage_dir,
            instrumented_dir,
            testem_dir,
            reports_dir,
            temp_root,
            cleanup,
        })
    }
}

// Generated names must not match DEFAULT_SCRATCH_PATTERN; the sweep would
// otherwise reach into other live runs.
const GENERATED_COVERAGE_PREFIX: &str = "harness-coverage";
const GENERATED_INSTRUMENTED_PREFIX: &str = "harness-instrumented";
const GENERATED_TESTEM_PREFIX: &str = "harness-testem";

fn generate_instance_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id.chars().take(8).collect()
}

// =============================================================================
// Builder
// =============================================================================

/// Programmatic assembly of a [`HarnessConfig`]
#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    /// Root for relative paths
    #[must_use]
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.base_dir = Some(dir.into());
        self
    }

    /// Register a package root
    #[must_use]
    pub fn package(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let _ = self.config.packages.insert(name.into(), root.into());
        self
    }

    /// Content server port
    #[must_use]
    pub const fn coverage_port(mut self, port: u16) -> Self {
        self.config.coverage_port = port;
        self
    }

    /// Content server interface
    #[must_use]
    pub const fn coverage_host(mut self, host: IpAddr) -> Self {
        self.config.coverage_host = host;
        self
    }

    /// Coverage receiver path
    #[must_use]
    pub fn coverage_path(mut self, path: impl Into<String>) -> Self {
        self.config.coverage_path = path.into();
        self
    }

    /// Coverage upload directory
    #[must_use]
    pub fn coverage_dir(mut self, path: impl Into<String>) -> Self {
        self.config.coverage_dir = Some(path.into());
        self
    }

    /// Instrumented source directory
    #[must_use]
    pub fn instrumented_source_dir(mut self, path: impl Into<String>) -> Self {
        self.config.instrumented_source_dir = Some(path.into());
        self
    }

    /// Runner working directory
    #[must_use]
    pub fn testem_dir(mut self, path: impl Into<String>) -> Self {
        self.config.testem_dir = Some(path.into());
        self
    }

    /// Report directory
    #[must_use]
    pub fn reports_dir(mut self, path: impl Into<String>) -> Self {
        self.config.reports_dir = Some(path.into());
        self
    }

    /// Add a source directory
    #[must_use]
    pub fn source_dir(mut self, def: DirectoryDefinition) -> Self {
        self.config.source_dirs.insert(def);
        self
    }

    /// Add a content directory
    #[must_use]
    pub fn content_dir(mut self, def: DirectoryDefinition) -> Self {
        self.config.content_dirs.insert(def);
        self
    }

    /// Add an extra proxy path
    #[must_use]
    pub fn additional_proxy(mut self, path: impl Into<String>) -> Self {
        self.config.additional_proxies.push(path.into());
        self
    }

    /// Explicit cleanup plan
    #[must_use]
    pub fn cleanup(mut self, plan: CleanupPlan) -> Self {
        self.config.cleanup = Some(plan);
        self
    }

    /// Secondary event timeout
    #[must_use]
    pub const fn wrapped_event_timeout_ms(mut self, ms: u64) -> Self {
        self.config.wrapped_event_timeout_ms = ms;
        self
    }

    /// Instrumentation setting
    #[must_use]
    pub fn instrument(mut self, setting: InstrumentSetting) -> Self {
        self.config.instrument = setting;
        self
    }

    /// Reporter setting
    #[must_use]
    pub fn report(mut self, setting: ReportSetting) -> Self {
        self.config.report = setting;
        self
    }

    /// Fixed instance id
    #[must_use]
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.config.instance_id = Some(id.into());
        self
    }

    /// Temp root to sweep
    #[must_use]
    pub fn temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_root = Some(dir.into());
        self
    }

    /// Validate and finish
    pub fn build(self) -> HarnessResult<HarnessConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
