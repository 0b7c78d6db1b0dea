//! Content server.
//!
//! One listener hosts every mount (source directories, served from their
//! instrumented copy when instrumentation is on, and content directories)
//! plus the coverage receiver. The runner's proxy layer forwards to it
//! using the map from [`ContentServer::proxy_map`].

use crate::coverage::{coverage_router, CoverageReceiver, DEFAULT_COVERAGE_PATH, DEFAULT_MAX_UPLOAD_BYTES};
use crate::event::LifecycleEvent;
use crate::fixture::{Fixture, FixtureState};
use crate::instrument::{instrument_all, InstrumentOptions, Instrumenter};
use crate::priority::Priority;
use crate::proxy::{ProxyMap, ResolvedDirectory};
use crate::result::{HarnessError, HarnessResult};
use async_trait::async_trait;
use axum::Router;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Fixture name of the content server
pub const CONTENT_SERVER_NAME: &str = "contentServer";

/// Default port of the content server
pub const DEFAULT_COVERAGE_PORT: u16 = 7000;

/// Where and how source directories get instrumented
#[derive(Debug, Clone)]
pub struct InstrumentationPlan {
    /// Tool that produces the instrumented tree
    pub instrumenter: Arc<dyn Instrumenter>,
    /// Root of the instrumented copies, `<root>/<segment>` per source
    pub destination_root: PathBuf,
    /// Options handed to every run
    pub options: InstrumentOptions,
}

/// Content server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: IpAddr,
    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,
    /// Source directories, in priority order
    pub sources: Vec<ResolvedDirectory>,
    /// Every mount served, ordered and de-duplicated by segment
    pub mounts: Vec<ResolvedDirectory>,
    /// Extra literal proxy paths
    pub extra_proxies: Vec<String>,
    /// Directory coverage files are written to
    pub coverage_dir: PathBuf,
    /// URL path of the coverage receiver
    pub coverage_path: String,
    /// Embedded in coverage file names
    pub instance_id: String,
    /// Upload size limit
    pub max_upload_bytes: usize,
    /// Answer cross-origin requests permissively
    pub cors: bool,
    /// Instrument sources before serving; `None` serves them verbatim
    pub instrumentation: Option<InstrumentationPlan>,
}

impl ServerConfig {
    /// Minimal configuration writing coverage to `coverage_dir`
    #[must_use]
    pub fn new(coverage_dir: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_COVERAGE_PORT,
            sources: Vec::new(),
            mounts: Vec::new(),
            extra_proxies: Vec::new(),
            coverage_dir: coverage_dir.into(),
            coverage_path: DEFAULT_COVERAGE_PATH.to_string(),
            instance_id: instance_id.into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            cors: true,
            instrumentation: None,
        }
    }

    /// Reject mount tables the router cannot host
    pub fn validate(&self) -> HarnessResult<()> {
        if !self.coverage_path.starts_with('/') || self.coverage_path.len() < 2 {
            return Err(HarnessError::config(format!(
                "coverage path '{}' must start with '/' and name a segment",
                self.coverage_path
            )));
        }
        for mount in &self.mounts {
            let segment = mount.segment.as_str();
            if segment.starts_with([':', '*']) || segment.contains(['{', '}']) {
                return Err(HarnessError::config(format!(
                    "mount segment '{segment}' of '{}' is not a literal path",
                    mount.key
                )));
            }
            if mount.url_path() == self.coverage_path {
                return Err(HarnessError::config(format!(
                    "mount '{}' collides with the coverage path {}",
                    mount.key, self.coverage_path
                )));
            }
        }
        Ok(())
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

#[derive(Default)]
struct Inner {
    state: FixtureState,
    running: Option<Running>,
    last_addr: Option<SocketAddr>,
}

/// HTTP server for test content and coverage uploads
pub struct ContentServer {
    config: ServerConfig,
    inner: Mutex<Inner>,
    started: LifecycleEvent<()>,
    stopped: LifecycleEvent<()>,
}

impl fmt::Debug for ContentServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentServer")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("mounts", &self.config.mounts.len())
            .finish_non_exhaustive()
    }
}

impl ContentServer {
    /// Server that has not been started
    pub fn new(config: ServerConfig) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(Inner::default()),
            started: LifecycleEvent::new("contentServer:started"),
            stopped: LifecycleEvent::new("contentServer:stopped"),
        })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bound address while running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().ok().and_then(|inner| inner.running.as_ref().map(|r| r.addr))
    }

    /// Base URL of the server; uses the bound port once started
    #[must_use]
    pub fn base_url(&self) -> String {
        let addr = self
            .lock()
            .ok()
            .and_then(|inner| inner.running.as_ref().map(|r| r.addr).or(inner.last_addr))
            .unwrap_or_else(|| SocketAddr::new(self.config.host, self.config.port));
        format!("http://{addr}")
    }

    /// URL browsers upload coverage to
    #[must_use]
    pub fn coverage_url(&self) -> String {
        format!("{}{}", self.base_url(), self.config.coverage_path)
    }

    /// Proxy table pointing every mount, the coverage path and the extra
    /// paths at this server
    #[must_use]
    pub fn proxy_map(&self) -> ProxyMap {
        let upstream = self.base_url();
        let mut proxies = ProxyMap::new();
        for mount in &self.config.mounts {
            proxies.insert(mount.url_path(), upstream.as_str());
        }
        proxies.insert(self.config.coverage_path.as_str(), upstream.as_str());
        for path in &self.config.extra_proxies {
            proxies.insert(path.as_str(), upstream.as_str());
        }
        proxies
    }

    fn lock(&self) -> HarnessResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| HarnessError::invalid_state("content server state lock poisoned"))
    }

    fn set_state(&self, state: FixtureState) -> HarnessResult<()> {
        self.lock()?.state = state;
        Ok(())
    }

    async fn serving_mounts(&self) -> HarnessResult<Vec<ResolvedDirectory>> {
        let Some(plan) = &self.config.instrumentation else {
            return Ok(self.config.mounts.clone());
        };

        info!(
            tool = plan.instrumenter.name(),
            sources = self.config.sources.len(),
            destination = %plan.destination_root.display(),
            "instrumenting sources"
        );
        let outputs = instrument_all(
            plan.instrumenter.as_ref(),
            &self.config.sources,
            &plan.destination_root,
            &plan.options,
        )
        .await?;

        let mut mounts = self.config.mounts.clone();
        for (source, output) in self.config.sources.iter().zip(outputs) {
            if let Some(mount) = mounts
                .iter_mut()
                .find(|m| m.key == source.key && m.path == source.path)
            {
                mount.path = output;
            }
        }
        Ok(mounts)
    }

    async fn router(&self, mounts: &[ResolvedDirectory]) -> HarnessResult<Router> {
        let receiver = Arc::new(
            CoverageReceiver::new(&self.config.coverage_dir, self.config.instance_id.clone()).await?,
        );
        let mut router = coverage_router(receiver, &self.config.coverage_path, self.config.max_upload_bytes);
        for mount in mounts {
            debug!(mount = %mount.url_path(), path = %mount.path.display(), "serving directory");
            router = router.nest_service(&mount.url_path(), ServeDir::new(&mount.path));
        }
        if self.config.cors {
            router = router.layer(CorsLayer::permissive());
        }
        Ok(router)
    }

    async fn launch(&self) -> HarnessResult<()> {
        let mounts = self.serving_mounts().await?;
        let router = self.router(&mounts).await?;

        let addr = SocketAddr::new(self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| HarnessError::ServerBind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| HarnessError::ServerBind { addr, source })?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        {
            let mut inner = self.lock()?;
            inner.running = Some(Running { addr, shutdown, task });
            inner.last_addr = Some(addr);
            inner.state = FixtureState::Started;
        }
        info!(addr = %addr, mounts = mounts.len(), "content server listening");
        self.started.fire(());
        Ok(())
    }
}

#[async_trait]
impl Fixture for ContentServer {
    fn name(&self) -> &str {
        CONTENT_SERVER_NAME
    }

    fn priority(&self) -> Priority {
        Priority::First
    }

    async fn start(&self) -> HarnessResult<()> {
        if self.lock()?.running.is_some() {
            return Err(HarnessError::invalid_state("content server is already running"));
        }
        match self.launch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(FixtureState::Failed)?;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> HarnessResult<()> {
        let running = self.lock()?.running.take();
        let Some(running) = running else {
            debug!("content server not running, nothing to stop");
            return Ok(());
        };

        if running.shutdown.send(()).is_err() {
            warn!("content server task already gone");
        }
        let outcome = running.task.await;
        self.set_state(FixtureState::Stopped)?;
        info!(addr = %running.addr, "content server stopped");
        self.stopped.fire(());

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HarnessError::Server {
                message: e.to_string(),
            }),
            Err(e) => Err(HarnessError::Server {
                message: format!("server task failed: {e}"),
            }),
        }
    }

    fn started(&self) -> LifecycleEvent<()> {
        self.started.clone()
    }

    fn stopped(&self) -> LifecycleEvent<()> {
        self.stopped.clone()
    }

    fn state(&self) -> FixtureState {
        self.lock().map_or(FixtureState::Failed, |inner| inner.state)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::instrument::CopyInstrumenter;
    use std::path::Path;
    use tempfile::TempDir;

    fn dir(key: &str, path: &Path, segment: &str) -> ResolvedDirectory {
        ResolvedDirectory {
            key: key.to_string(),
            path: path.to_path_buf(),
            segment: segment.to_string(),
        }
    }

    fn config(root: &Path) -> ServerConfig {
        let mut config = ServerConfig::new(root.join("coverage"), "inst");
        config.port = 0;
        config
    }

    #[test]
    fn test_proxy_map_before_start_uses_configured_port() {
        let root = TempDir::new().unwrap();
        let mut config = ServerConfig::new(root.path().join("coverage"), "inst");
        config.mounts = vec![dir("src", root.path(), "src")];
        config.extra_proxies = vec!["/api".to_string()];
        let server = ContentServer::new(config).unwrap();

        let proxies = server.proxy_map();
        assert_eq!(proxies.paths(), vec!["/src", "/coverage", "/api"]);
        assert_eq!(
            proxies.get("/src").unwrap().target,
            "http://127.0.0.1:7000"
        );
    }

    #[test]
    fn test_mount_colliding_with_coverage_path_is_rejected() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        config.mounts = vec![dir("cov", root.path(), "coverage")];
        assert!(matches!(
            ContentServer::new(config).unwrap_err(),
            HarnessError::Config { .. }
        ));
    }

    #[test]
    fn test_wildcard_segment_is_rejected() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        config.mounts = vec![dir("any", root.path(), "{rest}")];
        assert!(ContentServer::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let root = TempDir::new().unwrap();
        let server = ContentServer::new(config(root.path())).unwrap();
        assert_eq!(server.state(), FixtureState::Registered);

        server.start().await.unwrap();
        assert_eq!(server.state(), FixtureState::Started);
        assert!(server.started().has_fired());
        assert!(server.local_addr().unwrap().port() != 0);
        assert!(root.path().join("coverage").is_dir());

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert_eq!(server.state(), FixtureState::Stopped);
        assert_eq!(server.stopped().fire_count(), 1);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_double_start_is_an_error() {
        let root = TempDir::new().unwrap();
        let server = ContentServer::new(config(root.path())).unwrap();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await.unwrap_err(),
            HarnessError::InvalidState { .. }
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_error() {
        let root = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config(root.path());
        config.port = taken.local_addr().unwrap().port();
        let server = ContentServer::new(config).unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, HarnessError::ServerBind { .. }));
        assert!(err.is_fatal());
        assert_eq!(server.state(), FixtureState::Failed);
        assert!(!server.started().has_fired());
    }

    #[tokio::test]
    async fn test_instrumentation_failure_aborts_start() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        let missing = dir("src", &root.path().join("missing"), "src");
        config.sources = vec![missing.clone()];
        config.mounts = vec![missing];
        config.instrumentation = Some(InstrumentationPlan {
            instrumenter: Arc::new(CopyInstrumenter),
            destination_root: root.path().join("instrumented"),
            options: InstrumentOptions::default(),
        });
        let server = ContentServer::new(config).unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, HarnessError::Instrumentation { .. }));
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_serving_mounts_swaps_in_instrumented_copy() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.js"), "var a = 1;").unwrap();
        let tests = root.path().join("tests");

        let mut config = config(root.path());
        config.sources = vec![dir("src", &src, "src")];
        config.mounts = vec![dir("src", &src, "src"), dir("tests", &tests, "tests")];
        config.instrumentation = Some(InstrumentationPlan {
            instrumenter: Arc::new(CopyInstrumenter),
            destination_root: root.path().join("instrumented"),
            options: InstrumentOptions::default(),
        });
        let server = ContentServer::new(config).unwrap();

        let mounts = server.serving_mounts().await.unwrap();
        assert_eq!(mounts[0].path, root.path().join("instrumented/src"));
        assert_eq!(mounts[1].path, tests);
        assert!(root.path().join("instrumented/src/a.js").is_file());
    }
}
