//! Path resolution for package-relative and relative configuration paths.
//!
//! Every configured directory may be written in one of three forms:
//!
//! - `%package/rest/of/path` - relative to a registered package root
//! - `/absolute/path` - used as-is
//! - `relative/path` - relative to the resolver's base directory
//!
//! Resolution is purely lexical; nothing here touches the filesystem, so
//! directories that have not been created yet resolve just as well.

use crate::result::{HarnessError, HarnessResult};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Prefix marking a package-relative path
pub const PACKAGE_PREFIX: char = '%';

/// Resolves logical paths to absolute filesystem paths
#[derive(Debug, Clone)]
pub struct PathResolver {
    base_dir: PathBuf,
    packages: HashMap<String, PathBuf>,
}

impl PathResolver {
    /// Create a resolver rooted at `base_dir`
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: normalize(&base_dir.into()),
            packages: HashMap::new(),
        }
    }

    /// Create a resolver rooted at the process working directory
    pub fn from_current_dir() -> HarnessResult<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    /// Register a package root for `%name/...` paths
    #[must_use]
    pub fn with_package(mut self, name: impl Into<String>, root: impl AsRef<Path>) -> Self {
        let root = self.absolute(root.as_ref());
        let _ = self.packages.insert(name.into(), root);
        self
    }

    /// Base directory relative paths are joined onto
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a configured path to an absolute one
    pub fn resolve(&self, path: &str) -> HarnessResult<PathBuf> {
        if path.is_empty() {
            return Err(HarnessError::PathResolution {
                path: path.to_string(),
                message: "empty path".to_string(),
            });
        }

        if let Some(rest) = path.strip_prefix(PACKAGE_PREFIX) {
            let (package, remainder) = rest.split_once('/').unwrap_or((rest, ""));
            let root = self
                .packages
                .get(package)
                .ok_or_else(|| HarnessError::UnknownPackage {
                    package: package.to_string(),
                    path: path.to_string(),
                })?;
            return Ok(normalize(&root.join(remainder)));
        }

        Ok(self.absolute(Path::new(path)))
    }

    /// Resolve a path that is already a `Path` (absolute or base-relative)
    #[must_use]
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.base_dir.join(path))
        }
    }
}

/// Lexically remove `.` and `..` components
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    let _ = out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Compose `<base>/<prefix>-<suffix>`
#[must_use]
pub fn unique_dir_name(base: &Path, prefix: &str, suffix: &str) -> PathBuf {
    base.join(format!("{prefix}-{suffix}"))
}

/// Suffix used for generated directory names: `<ms timestamp>-<8 hex>`
#[must_use]
pub fn default_suffix() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &random[..8])
}

/// Last path component, used as a mount segment
#[must_use]
pub fn last_component(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
