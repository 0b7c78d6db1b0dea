//! Proxy map construction.
//!
//! The runner's reverse proxy resolves the first matching path prefix, so
//! the order of mounts matters. Source and content directory definitions
//! are expanded to absolute paths, ordered by priority across both groups
//! and turned into one `/<segment>` entry each, all pointing at the
//! content server. Extra literal paths are appended last.
//!
//! Keys are unique: a later entry with the same key replaces the earlier
//! entry's value in place.

use crate::paths::{last_component, PathResolver};
use crate::priority::{order_by_priority, Prioritized, Priority};
use crate::result::{HarnessError, HarnessResult};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::path::PathBuf;

/// A named mount point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryDefinition {
    /// Name other definitions may refer to in priorities
    #[serde(default)]
    pub key: String,
    /// Directory path in any form the resolver accepts
    #[serde(alias = "filePath")]
    pub file_path: String,
    /// Position among all directory definitions
    #[serde(default)]
    pub priority: Priority,
    /// Mount segment override; defaults to the last path component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
}

impl DirectoryDefinition {
    /// Definition with no priority or mount override
    #[must_use]
    pub fn new(key: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            file_path: file_path.into(),
            priority: Priority::Unordered,
            mount: None,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the mount segment
    #[must_use]
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = Some(mount.into());
        self
    }
}

/// A definition expanded against the filesystem layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDirectory {
    /// Definition key
    pub key: String,
    /// Absolute directory
    pub path: PathBuf,
    /// Mount segment, without slashes
    pub segment: String,
}

impl ResolvedDirectory {
    /// URL path prefix this directory is served under
    #[must_use]
    pub fn url_path(&self) -> String {
        format!("/{}", self.segment)
    }
}

/// Target of one proxy entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    /// Upstream base URL
    pub target: String,
}

/// Ordered proxy table with unique keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyMap {
    entries: Vec<(String, ProxyTarget)>,
}

impl ProxyMap {
    /// Empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced key keeps its original position
    pub fn insert(&mut self, path: impl Into<String>, target: impl Into<String>) {
        let path = path.into();
        let target = ProxyTarget {
            target: target.into(),
        };
        if let Some(slot) = self.entries.iter_mut().find(|(p, _)| *p == path) {
            slot.1 = target;
        } else {
            self.entries.push((path, target));
        }
    }

    /// Target for a path prefix
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ProxyTarget> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, t)| t)
    }

    /// Number of distinct keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in order
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        self.entries.iter().map(|(p, _)| p.as_str()).collect()
    }

    /// Entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProxyTarget)> {
        self.entries.iter().map(|(p, t)| (p.as_str(), t))
    }

    /// Pretty JSON in the shape the runner's proxy layer reads
    pub fn to_json_pretty(&self) -> HarnessResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Serialize for ProxyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (path, target) in &self.entries {
            map.serialize_entry(path, target)?;
        }
        map.end()
    }
}

/// Builds proxy maps and the mount list they describe
#[derive(Debug, Clone)]
pub struct ProxyPathBuilder {
    resolver: PathResolver,
}

impl ProxyPathBuilder {
    /// Builder resolving paths with `resolver`
    #[must_use]
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// Expand and order both groups of definitions.
    ///
    /// The result still contains duplicate segments in priority order.
    pub fn expand(
        &self,
        source_dirs: &[DirectoryDefinition],
        content_dirs: &[DirectoryDefinition],
    ) -> HarnessResult<Vec<ResolvedDirectory>> {
        let mut entries = Vec::with_capacity(source_dirs.len() + content_dirs.len());
        for def in source_dirs.iter().chain(content_dirs) {
            let resolved = self.resolve(def)?;
            entries.push(Prioritized::new(def.key.clone(), def.priority.clone(), resolved));
        }
        Ok(order_by_priority(entries)?
            .into_iter()
            .map(|e| e.item)
            .collect())
    }

    /// Ordered mounts with duplicate segments collapsed, last write wins
    pub fn resolve_mounts(
        &self,
        source_dirs: &[DirectoryDefinition],
        content_dirs: &[DirectoryDefinition],
    ) -> HarnessResult<Vec<ResolvedDirectory>> {
        let mut mounts: Vec<ResolvedDirectory> = Vec::new();
        for dir in self.expand(source_dirs, content_dirs)? {
            if let Some(slot) = mounts.iter_mut().find(|m| m.segment == dir.segment) {
                *slot = dir;
            } else {
                mounts.push(dir);
            }
        }
        Ok(mounts)
    }

    /// Build the proxy map
    pub fn build(
        &self,
        source_dirs: &[DirectoryDefinition],
        content_dirs: &[DirectoryDefinition],
        extra_paths: &[String],
        upstream_base_url: &str,
    ) -> HarnessResult<ProxyMap> {
        let mut proxies = ProxyMap::new();
        for dir in self.expand(source_dirs, content_dirs)? {
            proxies.insert(dir.url_path(), upstream_base_url);
        }
        for path in extra_paths {
            proxies.insert(path.clone(), upstream_base_url);
        }
        Ok(proxies)
    }

    /// Expand a single definition
    pub fn resolve(&self, def: &DirectoryDefinition) -> HarnessResult<ResolvedDirectory> {
        let path = self.resolver.resolve(&def.file_path)?;
        let segment = match &def.mount {
            Some(mount) => mount.trim_matches('/').to_string(),
            None => last_component(&path).unwrap_or_default(),
        };
        if segment.is_empty() {
            return Err(HarnessError::config(format!(
                "directory '{}' ({}) has no mount segment; set `mount` explicitly",
                def.key, def.file_path
            )));
        }
        Ok(ResolvedDirectory {
            key: def.key.clone(),
            path,
            segment,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const UPSTREAM: &str = "http://localhost:7000";

    fn builder() -> ProxyPathBuilder {
        ProxyPathBuilder::new(PathResolver::new("/work/pkg").with_package("pkg", "/work/pkg"))
    }

    #[test]
    fn test_build_in_declaration_order() {
        let sources = vec![DirectoryDefinition::new("src", "%pkg/src")];
        let contents = vec![
            DirectoryDefinition::new("tests", "tests"),
            DirectoryDefinition::new("node_modules", "node_modules"),
        ];
        let proxies = builder()
            .build(&sources, &contents, &["/extra".to_string()], UPSTREAM)
            .unwrap();

        assert_eq!(
            proxies.paths(),
            vec!["/src", "/tests", "/node_modules", "/extra"]
        );
        assert!(proxies.iter().all(|(_, t)| t.target == UPSTREAM));
    }

    #[test]
    fn test_build_respects_priorities_across_groups() {
        let sources = vec![
            DirectoryDefinition::new("src", "src"),
            DirectoryDefinition::new("lib", "lib").with_priority(Priority::Last),
        ];
        let contents = vec![
            DirectoryDefinition::new("deps", "node_modules/dep").with_priority(Priority::First),
            DirectoryDefinition::new("tests", "tests").with_priority(Priority::before("src")),
        ];
        let proxies = builder().build(&sources, &contents, &[], UPSTREAM).unwrap();
        assert_eq!(proxies.paths(), vec!["/dep", "/tests", "/src", "/lib"]);
    }

    #[test]
    fn test_same_key_last_write_wins() {
        let sources = vec![DirectoryDefinition::new("src", "a/src")];
        let contents = vec![
            DirectoryDefinition::new("tests", "tests"),
            DirectoryDefinition::new("otherSrc", "b/src"),
        ];
        let proxies = builder()
            .build(&sources, &contents, &["/tests".to_string()], "http://127.0.0.1:9999")
            .unwrap();

        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies.paths(), vec!["/src", "/tests"]);
        assert_eq!(
            proxies.get("/tests").unwrap().target,
            "http://127.0.0.1:9999"
        );

        let mounts = builder().resolve_mounts(&sources, &contents).unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].path, PathBuf::from("/work/pkg/b/src"));
        assert_eq!(mounts[0].key, "otherSrc");
    }

    #[test]
    fn test_mount_override() {
        let def = DirectoryDefinition::new("root", "/").with_mount("/site/");
        let resolved = builder().resolve(&def).unwrap();
        assert_eq!(resolved.segment, "site");
        assert_eq!(resolved.url_path(), "/site");
    }

    #[test]
    fn test_root_without_mount_is_rejected() {
        let def = DirectoryDefinition::new("root", "/");
        assert!(builder().resolve(&def).is_err());
    }

    #[test]
    fn test_serializes_as_ordered_object() {
        let mut proxies = ProxyMap::new();
        proxies.insert("/src", UPSTREAM);
        proxies.insert("/coverage", UPSTREAM);
        let json = serde_json::to_string(&proxies).unwrap();
        assert_eq!(
            json,
            r#"{"/src":{"target":"http://localhost:7000"},"/coverage":{"target":"http://localhost:7000"}}"#
        );
    }

    #[test]
    fn test_definition_deserializes_camel_case() {
        let def: DirectoryDefinition =
            serde_json::from_str(r#"{"key":"src","filePath":"%pkg/src","priority":"first"}"#)
                .unwrap();
        assert_eq!(def.file_path, "%pkg/src");
        assert_eq!(def.priority, Priority::First);
    }
}
