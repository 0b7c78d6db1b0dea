//! Lifecycle orchestration.
//!
//! The runner calls two hooks: one when it is ready to start and one when
//! it is about to exit. Each hook runs a priority-ordered chain of steps
//! and then invokes the runner's callback exactly once, whatever the chain
//! did. Step failures reject the chain; they are logged and never reach
//! the runner.
//!
//! ```text
//! runnerStarting: cleanup(first) -> constructFixtures -> waitForFixtures
//! runnerExiting:  stopServer(first) -> waitForFixtures -> coverageReport -> cleanup(last)
//! ```
//!
//! The secondary waits are timeout guarded: if the gating event never
//! fires the chain continues in degraded mode instead of hanging.

use crate::chain::{ChainBuilder, ChainOutcome, StepChain, StepFn, StepFuture};
use crate::cleanup::{CleanupPlan, CleanupSequencer, CleanupStage};
use crate::config::{HarnessConfig, RunLayout};
use crate::event::{wait_for_all, wait_with_timeout, LifecycleEvent};
use crate::fixture::{Fixture, FixtureSet};
use crate::instrument::Instrumenter;
use crate::priority::Priority;
use crate::proxy::{ProxyMap, ProxyPathBuilder};
use crate::reporter::Reporter;
use crate::result::{HarnessError, HarnessResult};
use crate::server::{ContentServer, InstrumentationPlan, ServerConfig};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Startup chain name
pub const RUNNER_STARTING: &str = "runnerStarting";
/// Shutdown chain name
pub const RUNNER_EXITING: &str = "runnerExiting";

/// Cleanup step, first on startup and last on shutdown
pub const STEP_CLEANUP: &str = "cleanup";
/// Starts every fixture
pub const STEP_CONSTRUCT_FIXTURES: &str = "constructFixtures";
/// Waits for the fixtures event of the current chain
pub const STEP_WAIT_FOR_FIXTURES: &str = "waitForFixtures";
/// Stops every fixture, the content server included
pub const STEP_STOP_SERVER: &str = "stopServer";
/// Runs the reporter
pub const STEP_COVERAGE_REPORT: &str = "coverageReport";

/// Which hook is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `on_runner_ready`
    Startup,
    /// `on_runner_exit`
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => f.write_str(RUNNER_STARTING),
            Self::Shutdown => f.write_str(RUNNER_EXITING),
        }
    }
}

/// Events owned by the orchestrator for one run
#[derive(Debug, Clone)]
pub struct OrchestratorEvents {
    /// Fired when fixture construction begins
    pub construct_fixtures: LifecycleEvent<()>,
    /// Fired once every fixture reported started
    pub fixtures_constructed: LifecycleEvent<()>,
    /// Fired when fixture teardown begins
    pub stop_fixtures: LifecycleEvent<()>,
    /// Fired once every running fixture reported stopped
    pub fixtures_stopped: LifecycleEvent<()>,
}

impl OrchestratorEvents {
    fn new() -> Self {
        Self {
            construct_fixtures: LifecycleEvent::new("constructFixtures"),
            fixtures_constructed: LifecycleEvent::new("onFixturesConstructed"),
            stop_fixtures: LifecycleEvent::new("stopFixtures"),
            fixtures_stopped: LifecycleEvent::new("onFixturesStopped"),
        }
    }
}

/// State the steps operate on
struct RunContext {
    fixtures: FixtureSet,
    events: OrchestratorEvents,
    sequencer: CleanupSequencer,
    cleanup: CleanupPlan,
    reporter: Option<Arc<dyn Reporter>>,
    layout: RunLayout,
    timeout: Duration,
}

impl RunContext {
    async fn cleanup(&self, stage: CleanupStage) -> HarnessResult<()> {
        match self.sequencer.run(stage, self.cleanup.for_stage(stage)).await {
            Ok(report) if !report.failed.is_empty() => {
                warn!(stage = %stage, failed = report.failed.len(), "cleanup left some paths behind");
            }
            Ok(_) => {}
            Err(e) => warn!(stage = %stage, error = %e, "cleanup stage failed, continuing"),
        }
        Ok(())
    }

    async fn construct_fixtures(&self) -> HarnessResult<()> {
        let started = self.fixtures.started_events();
        for event in &started {
            event.reset();
        }

        let constructed = self.events.fixtures_constructed.clone();
        let timeout = self.timeout;
        let gate = tokio::spawn(async move {
            if wait_for_all(&started, timeout).await.is_some() {
                constructed.fire(());
            }
        });

        if let Err(e) = tokio::fs::create_dir_all(&self.layout.testem_dir).await {
            gate.abort();
            return Err(e.into());
        }
        self.events.construct_fixtures.fire(());
        if let Err(e) = self.fixtures.start_all().await {
            gate.abort();
            return Err(e);
        }
        Ok(())
    }

    async fn wait_for(&self, event: &LifecycleEvent<()>) -> HarnessResult<()> {
        if wait_with_timeout(event, self.timeout).await.is_some() {
            debug!(event = %event.name(), "fixtures settled");
        }
        Ok(())
    }

    async fn stop_fixtures(&self) -> HarnessResult<()> {
        let running = self.fixtures.running_stopped_events();
        let stopped = self.events.fixtures_stopped.clone();
        if running.is_empty() {
            stopped.fire(());
        } else {
            let timeout = self.timeout;
            drop(tokio::spawn(async move {
                if wait_for_all(&running, timeout).await.is_some() {
                    stopped.fire(());
                }
            }));
        }

        self.events.stop_fixtures.fire(());
        if let Err(e) = self.fixtures.stop_all().await {
            warn!(error = %e, "fixture teardown reported an error, continuing");
        }
        Ok(())
    }

    async fn coverage_report(&self) -> HarnessResult<()> {
        let Some(reporter) = &self.reporter else {
            return Ok(());
        };
        let coverage_dir = &self.layout.coverage_dir;
        if !tokio::fs::try_exists(coverage_dir).await.unwrap_or(false) {
            warn!(dir = %coverage_dir.display(), "no coverage directory, skipping report");
            return Ok(());
        }
        let outcome = reporter.report(coverage_dir, &self.layout.reports_dir).await?;
        info!(
            reporter = reporter.name(),
            files_read = outcome.files_read,
            outputs = outcome.outputs.len(),
            "coverage report finished"
        );
        Ok(())
    }
}

fn bind<F, Fut>(ctx: &Arc<RunContext>, f: F) -> impl Fn() -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<RunContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HarnessResult<()>> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    move || f(Arc::clone(&ctx))
}

/// Invokes the runner's callback once, on the success path or on drop
struct RunnerCallback<F: FnOnce()> {
    phase: Phase,
    callback: Option<F>,
}

impl<F: FnOnce()> RunnerCallback<F> {
    fn new(phase: Phase, callback: F) -> Self {
        Self {
            phase,
            callback: Some(callback),
        }
    }

    fn invoke(mut self) {
        if let Some(callback) = self.callback.take() {
            debug!(phase = %self.phase, "invoking runner callback");
            callback();
        }
    }
}

impl<F: FnOnce()> Drop for RunnerCallback<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!(phase = %self.phase, "lifecycle task dropped before settling, invoking runner callback");
            callback();
        }
    }
}

struct Inner {
    startup: StepChain,
    shutdown: StepChain,
    context: Arc<RunContext>,
    server: Arc<ContentServer>,
    runtime: Option<Handle>,
    phase_lock: tokio::sync::Mutex<()>,
}

/// Drives one test run through the runner's two lifecycle hooks
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for LifecycleOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleOrchestrator")
            .field("startup", &self.inner.startup)
            .field("shutdown", &self.inner.shutdown)
            .field("fixtures", &self.inner.context.fixtures)
            .finish_non_exhaustive()
    }
}

impl LifecycleOrchestrator {
    /// Builder for `config`
    #[must_use]
    pub fn builder(config: HarnessConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Orchestrator with the configured server, reporter and instrumenter
    pub fn from_config(config: HarnessConfig) -> HarnessResult<Self> {
        OrchestratorBuilder::new(config).build()
    }

    /// Runner "ready" hook.
    ///
    /// Runs the startup chain in the background and then calls `callback`
    /// exactly once, whether the chain resolved, rejected or panicked.
    pub fn on_runner_ready<F>(&self, config: &Value, data: &Value, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        debug!(?config, ?data, "runner ready");
        self.dispatch(Phase::Startup, callback);
    }

    /// Runner "exit" hook; same contract as [`Self::on_runner_ready`]
    pub fn on_runner_exit<F>(&self, config: &Value, data: &Value, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        debug!(?config, ?data, "runner exiting");
        self.dispatch(Phase::Shutdown, callback);
    }

    /// Run the startup chain and return how it settled
    pub async fn runner_starting(&self) -> ChainOutcome {
        self.run_phase(Phase::Startup).await
    }

    /// Run the shutdown chain and return how it settled
    pub async fn runner_exiting(&self) -> ChainOutcome {
        self.run_phase(Phase::Shutdown).await
    }

    /// Orchestrator events
    #[must_use]
    pub fn events(&self) -> &OrchestratorEvents {
        &self.inner.context.events
    }

    /// The content server
    #[must_use]
    pub fn server(&self) -> &Arc<ContentServer> {
        &self.inner.server
    }

    /// Every fixture, in start order
    #[must_use]
    pub fn fixtures(&self) -> &FixtureSet {
        &self.inner.context.fixtures
    }

    /// Directories of this run
    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.inner.context.layout
    }

    /// Proxy table for the runner, pointing at the content server
    #[must_use]
    pub fn proxy_map(&self) -> ProxyMap {
        self.inner.server.proxy_map()
    }

    /// Write the proxy table as pretty JSON
    pub async fn write_proxy_map(&self, path: &Path) -> HarnessResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.proxy_map().to_json_pretty()?).await?;
        Ok(())
    }

    /// Startup step names in execution order
    #[must_use]
    pub fn startup_steps(&self) -> Vec<&str> {
        self.inner.startup.step_names()
    }

    /// Shutdown step names in execution order
    #[must_use]
    pub fn shutdown_steps(&self) -> Vec<&str> {
        self.inner.shutdown.step_names()
    }

    async fn run_phase(&self, phase: Phase) -> ChainOutcome {
        let _serialized = self.inner.phase_lock.lock().await;
        let events = &self.inner.context.events;
        let chain = match phase {
            Phase::Startup => {
                events.construct_fixtures.reset();
                events.fixtures_constructed.reset();
                &self.inner.startup
            }
            Phase::Shutdown => {
                events.stop_fixtures.reset();
                events.fixtures_stopped.reset();
                &self.inner.shutdown
            }
        };
        info!(phase = %phase, steps = %chain.step_names().join(" -> "), "lifecycle chain starting");
        chain.run().await
    }

    fn dispatch<F>(&self, phase: Phase, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let callback = RunnerCallback::new(phase, callback);
        let runtime = self
            .inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());
        let Some(runtime) = runtime else {
            error!(phase = %phase, "no async runtime available, skipping lifecycle chain");
            callback.invoke();
            return;
        };

        let this = self.clone();
        drop(runtime.spawn(async move {
            let chain = tokio::spawn(async move { this.run_phase(phase).await });
            let outcome = match chain.await {
                Ok(outcome) => outcome,
                Err(e) => ChainOutcome::aborted(
                    phase.to_string(),
                    "panic",
                    HarnessError::invalid_state(format!("lifecycle chain panicked: {e}")),
                ),
            };
            log_outcome(phase, &outcome);
            callback.invoke();
        }));
    }
}

fn log_outcome(phase: Phase, outcome: &ChainOutcome) {
    match &outcome.failure {
        None => info!(
            phase = %phase,
            steps = outcome.completed.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "lifecycle chain resolved"
        ),
        Some(failure) => error!(
            phase = %phase,
            step = %failure.step,
            fatal = failure.error.is_fatal(),
            error = %failure.error,
            completed = %outcome.completed.join(", "),
            "lifecycle chain rejected"
        ),
    }
}

/// Assembles an orchestrator from configuration plus optional extras
pub struct OrchestratorBuilder {
    config: HarnessConfig,
    fixtures: Vec<Arc<dyn Fixture>>,
    startup_steps: Vec<(String, Priority, StepFn)>,
    shutdown_steps: Vec<(String, Priority, StepFn)>,
    reporter: Option<Option<Arc<dyn Reporter>>>,
    instrumenter: Option<Option<Arc<dyn Instrumenter>>>,
    runtime: Option<Handle>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("fixtures", &self.fixtures.len())
            .field("startup_steps", &self.startup_steps.len())
            .field("shutdown_steps", &self.shutdown_steps.len())
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Builder for `config`
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            fixtures: Vec::new(),
            startup_steps: Vec::new(),
            shutdown_steps: Vec::new(),
            reporter: None,
            instrumenter: None,
            runtime: None,
        }
    }

    /// Add a fixture next to the content server
    #[must_use]
    pub fn fixture(mut self, fixture: Arc<dyn Fixture>) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// Add a step to the startup chain
    #[must_use]
    pub fn startup_step<F, Fut>(mut self, name: impl Into<String>, priority: Priority, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HarnessResult<()>> + Send + 'static,
    {
        self.startup_steps.push((name.into(), priority, boxed(f)));
        self
    }

    /// Add a step to the shutdown chain
    #[must_use]
    pub fn shutdown_step<F, Fut>(mut self, name: impl Into<String>, priority: Priority, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HarnessResult<()>> + Send + 'static,
    {
        self.shutdown_steps.push((name.into(), priority, boxed(f)));
        self
    }

    /// Replace the configured reporter; `None` drops the report step
    #[must_use]
    pub fn reporter(mut self, reporter: Option<Arc<dyn Reporter>>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Replace the configured instrumenter; `None` serves sources as-is
    #[must_use]
    pub fn instrumenter(mut self, instrumenter: Option<Arc<dyn Instrumenter>>) -> Self {
        self.instrumenter = Some(instrumenter);
        self
    }

    /// Runtime the hooks spawn onto when called outside of one
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Resolve paths, priorities and the mount table
    pub fn build(self) -> HarnessResult<LifecycleOrchestrator> {
        let config = self.config;
        config.validate()?;
        let resolver = config.resolver()?;
        let layout = config.layout(&resolver)?;

        let paths = ProxyPathBuilder::new(resolver.clone());
        let source_dirs = config.source_dirs.definitions();
        let content_dirs = config.content_dirs.definitions();
        let sources = paths.expand(source_dirs, &[])?;
        let mounts = paths.resolve_mounts(source_dirs, content_dirs)?;

        let instrumenter = self
            .instrumenter
            .unwrap_or_else(|| config.instrument.instrumenter());
        let reporter = self.reporter.unwrap_or_else(|| config.report.reporter());

        let server_config = ServerConfig {
            host: config.coverage_host,
            port: config.coverage_port,
            sources,
            mounts,
            extra_proxies: config.additional_proxies.clone(),
            coverage_dir: layout.coverage_dir.clone(),
            coverage_path: config.coverage_path.clone(),
            instance_id: layout.instance_id.clone(),
            max_upload_bytes: config.max_upload_bytes,
            cors: config.cors,
            instrumentation: instrumenter.map(|instrumenter| InstrumentationPlan {
                instrumenter,
                destination_root: layout.instrumented_dir.clone(),
                options: config.instrument_options(),
            }),
        };
        let server = Arc::new(ContentServer::new(server_config)?);

        let mut fixtures: Vec<Arc<dyn Fixture>> = vec![Arc::clone(&server) as Arc<dyn Fixture>];
        fixtures.extend(self.fixtures);
        let fixtures = FixtureSet::new(fixtures)?;

        let sequencer = CleanupSequencer::new(resolver)?
            .with_temp_root(layout.temp_root.clone())
            .with_scratch_pattern(&config.testem_scratch_pattern)?;

        let has_reporter = reporter.is_some();
        let context = Arc::new(RunContext {
            fixtures,
            events: OrchestratorEvents::new(),
            sequencer,
            cleanup: layout.cleanup.clone(),
            reporter,
            layout,
            timeout: config.wrapped_event_timeout(),
        });

        let mut startup = ChainBuilder::new(RUNNER_STARTING)
            .step(
                STEP_CLEANUP,
                Priority::First,
                bind(&context, |ctx| async move { ctx.cleanup(CleanupStage::Initial).await }),
            )
            .step(
                STEP_CONSTRUCT_FIXTURES,
                Priority::after(STEP_CLEANUP),
                bind(&context, |ctx| async move { ctx.construct_fixtures().await }),
            )
            .step(
                STEP_WAIT_FOR_FIXTURES,
                Priority::after(STEP_CONSTRUCT_FIXTURES),
                bind(&context, |ctx| async move {
                    ctx.wait_for(&ctx.events.fixtures_constructed).await
                }),
            );
        for (name, priority, body) in self.startup_steps {
            startup = startup.boxed_step(name, priority, body);
        }

        let mut shutdown = ChainBuilder::new(RUNNER_EXITING)
            .step(
                STEP_STOP_SERVER,
                Priority::First,
                bind(&context, |ctx| async move { ctx.stop_fixtures().await }),
            )
            .step(
                STEP_WAIT_FOR_FIXTURES,
                Priority::after(STEP_STOP_SERVER),
                bind(&context, |ctx| async move {
                    ctx.wait_for(&ctx.events.fixtures_stopped).await
                }),
            );
        if has_reporter {
            shutdown = shutdown.step(
                STEP_COVERAGE_REPORT,
                Priority::after(STEP_WAIT_FOR_FIXTURES),
                bind(&context, |ctx| async move { ctx.coverage_report().await }),
            );
        }
        shutdown = shutdown.step(
            STEP_CLEANUP,
            Priority::Last,
            bind(&context, |ctx| async move { ctx.cleanup(CleanupStage::Final).await }),
        );
        for (name, priority, body) in self.shutdown_steps {
            shutdown = shutdown.boxed_step(name, priority, body);
        }

        let orchestrator = LifecycleOrchestrator {
            inner: Arc::new(Inner {
                startup: startup.build()?,
                shutdown: shutdown.build()?,
                context,
                server,
                runtime: self.runtime.or_else(|| Handle::try_current().ok()),
                phase_lock: tokio::sync::Mutex::new(()),
            }),
        };
        info!(
            startup = %orchestrator.startup_steps().join(" -> "),
            shutdown = %orchestrator.shutdown_steps().join(" -> "),
            fixtures = %orchestrator.fixtures().names().join(", "),
            "orchestrator assembled"
        );
        Ok(orchestrator)
    }
}

fn boxed<F, Fut>(f: F) -> StepFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HarnessResult<()>> + Send + 'static,
{
    Arc::new(move || -> StepFuture { Box::pin(f()) })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::{BuiltinReport, InstrumentSetting, ReportSetting};
    use crate::fixture::tests::RecordingFixture;
    use crate::fixture::FixtureState;
    use crate::proxy::DirectoryDefinition;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn config(root: &Path) -> HarnessConfig {
        std::fs::create_dir_all(root.join("tests")).unwrap();
        std::fs::write(root.join("tests/index.html"), "<html></html>").unwrap();
        HarnessConfig::builder()
            .base_dir(root)
            .temp_root(root.join("tmp"))
            .coverage_port(0)
            .instance_id("test")
            .content_dir(DirectoryDefinition::new("tests", "tests"))
            .instrument(InstrumentSetting::Enabled(false))
            .report(ReportSetting::Builtin(BuiltinReport::None))
            .wrapped_event_timeout_ms(2_000)
            .build()
            .unwrap()
    }

    /// Starts without ever firing its started event
    struct SilentFixture {
        started: LifecycleEvent<()>,
        stopped: LifecycleEvent<()>,
    }

    impl SilentFixture {
        fn new() -> Self {
            Self {
                started: LifecycleEvent::new("silent:started"),
                stopped: LifecycleEvent::new("silent:stopped"),
            }
        }
    }

    #[async_trait]
    impl Fixture for SilentFixture {
        fn name(&self) -> &str {
            "silent"
        }

        async fn start(&self) -> HarnessResult<()> {
            Ok(())
        }

        async fn stop(&self) -> HarnessResult<()> {
            Ok(())
        }

        fn started(&self) -> LifecycleEvent<()> {
            self.started.clone()
        }

        fn stopped(&self) -> LifecycleEvent<()> {
            self.stopped.clone()
        }

        fn state(&self) -> FixtureState {
            FixtureState::Registered
        }
    }

    fn counting_callback(
        count: &Arc<AtomicUsize>,
        tx: &mpsc::UnboundedSender<()>,
    ) -> impl FnOnce() + Send + 'static {
        let count = Arc::clone(count);
        let tx = tx.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }
    }

    #[tokio::test]
    async fn test_chain_order() {
        let root = TempDir::new().unwrap();
        let orchestrator = LifecycleOrchestrator::from_config(config(root.path())).unwrap();
        assert_eq!(
            orchestrator.startup_steps(),
            vec!["cleanup", "constructFixtures", "waitForFixtures"]
        );
        assert_eq!(
            orchestrator.shutdown_steps(),
            vec!["stopServer", "waitForFixtures", "cleanup"]
        );

        let with_report = LifecycleOrchestrator::builder(config(root.path()))
            .reporter(Some(Arc::new(crate::reporter::SummaryReporter)))
            .build()
            .unwrap();
        assert_eq!(
            with_report.shutdown_steps(),
            vec!["stopServer", "waitForFixtures", "coverageReport", "cleanup"]
        );
    }

    #[tokio::test]
    async fn test_user_steps_are_ordered_by_priority() {
        let root = TempDir::new().unwrap();
        let orchestrator = LifecycleOrchestrator::builder(config(root.path()))
            .startup_step("writeProxies", Priority::after("waitForFixtures"), || async { Ok(()) })
            .startup_step("banner", Priority::before("cleanup"), || async { Ok(()) })
            .build()
            .unwrap();
        assert_eq!(
            orchestrator.startup_steps(),
            vec!["banner", "cleanup", "constructFixtures", "waitForFixtures", "writeProxies"]
        );
    }

    #[tokio::test]
    async fn test_unknown_step_reference_fails_build() {
        let root = TempDir::new().unwrap();
        let err = LifecycleOrchestrator::builder(config(root.path()))
            .shutdown_step("late", Priority::after("nothing"), || async { Ok(()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, HarnessError::Priority { .. }));
    }

    #[tokio::test]
    async fn test_full_run_serves_reports_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let orchestrator = LifecycleOrchestrator::builder(config(root.path()))
            .reporter(Some(Arc::new(crate::reporter::SummaryReporter)))
            .build()
            .unwrap();

        let outcome = orchestrator.runner_starting().await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(orchestrator.events().construct_fixtures.has_fired());
        assert!(orchestrator.events().fixtures_constructed.has_fired());
        assert_eq!(orchestrator.server().state(), FixtureState::Started);
        assert!(orchestrator.layout().testem_dir.is_dir());

        let coverage_dir = orchestrator.layout().coverage_dir.clone();
        std::fs::write(
            coverage_dir.join("coverage-x.json"),
            r#"{"a.js":{"s":{"0":1,"1":0}}}"#,
        )
        .unwrap();

        let outcome = orchestrator.runner_exiting().await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(
            outcome.completed,
            vec!["stopServer", "waitForFixtures", "coverageReport", "cleanup"]
        );
        assert!(orchestrator.events().fixtures_stopped.has_fired());
        assert!(!coverage_dir.exists());
        assert!(!orchestrator.layout().testem_dir.exists());
        assert!(orchestrator
            .layout()
            .reports_dir
            .join(crate::reporter::SUMMARY_JSON)
            .is_file());
    }

    #[tokio::test]
    async fn test_callback_fires_once_when_every_step_fails() {
        let root = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut cfg = config(root.path());
        cfg.cleanup = Some(CleanupPlan {
            initial: vec![crate::cleanup::CleanupDefinition::new("bad", "%nowhere/x")],
            final_stage: vec![crate::cleanup::CleanupDefinition::new("bad", "%nowhere/y")],
        });
        let orchestrator = LifecycleOrchestrator::builder(cfg)
            .fixture(Arc::new(RecordingFixture::new("broken", Priority::Last, &log).failing()))
            .shutdown_step("explode", Priority::First, || async {
                Err(HarnessError::fixture("teardown step failed"))
            })
            .build()
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.on_runner_ready(&Value::Null, &Value::Null, counting_callback(&count, &tx));
        rx.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!orchestrator.events().fixtures_constructed.has_fired());
        assert_eq!(orchestrator.server().state(), FixtureState::Stopped);

        orchestrator.on_runner_exit(&Value::Null, &Value::Null, counting_callback(&count, &tx));
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_callback_fires_when_a_step_panics() {
        let root = TempDir::new().unwrap();
        let orchestrator = LifecycleOrchestrator::builder(config(root.path()))
            .startup_step("boom", Priority::First, || async {
                let result: HarnessResult<()> = Ok(());
                if result.is_ok() {
                    panic!("step blew up");
                }
                result
            })
            .build()
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.on_runner_ready(&Value::Null, &Value::Null, counting_callback(&count, &tx));
        rx.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The phase lock is released after a panic; shutdown still runs.
        let outcome = orchestrator.runner_exiting().await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_startup_degrades_when_fixture_never_signals() {
        let root = TempDir::new().unwrap();
        let mut cfg = config(root.path());
        cfg.wrapped_event_timeout_ms = 100;
        let orchestrator = LifecycleOrchestrator::builder(cfg)
            .fixture(Arc::new(SilentFixture::new()))
            .build()
            .unwrap();

        let started = Instant::now();
        let outcome = orchestrator.runner_starting().await;
        let elapsed = started.elapsed();

        assert!(outcome.is_success());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert!(!orchestrator.events().fixtures_constructed.has_fired());
        assert_eq!(orchestrator.events().fixtures_constructed.listener_count(), 0);

        assert!(orchestrator.runner_exiting().await.is_success());
    }

    #[tokio::test]
    async fn test_exit_without_start_is_prompt_and_idempotent() {
        let root = TempDir::new().unwrap();
        let orchestrator = LifecycleOrchestrator::from_config(config(root.path())).unwrap();

        let started = Instant::now();
        assert!(orchestrator.runner_exiting().await.is_success());
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(orchestrator.runner_starting().await.is_success());
        assert!(orchestrator.runner_exiting().await.is_success());
        assert!(orchestrator.runner_exiting().await.is_success());
        assert_eq!(orchestrator.server().stopped().fire_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_rejects_startup() {
        let root = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config(root.path());
        cfg.coverage_port = taken.local_addr().unwrap().port();
        let orchestrator = LifecycleOrchestrator::from_config(cfg).unwrap();

        let outcome = orchestrator.runner_starting().await;
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.step, STEP_CONSTRUCT_FIXTURES);
        assert!(failure.error.is_fatal());
        assert!(!orchestrator.events().fixtures_constructed.has_fired());
    }

    #[test]
    fn test_callback_fires_without_runtime() {
        let root = TempDir::new().unwrap();
        let orchestrator = LifecycleOrchestrator::from_config(config(root.path())).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        orchestrator.on_runner_ready(&Value::Null, &Value::Null, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_proxy_map() {
        let root = TempDir::new().unwrap();
        let orchestrator = LifecycleOrchestrator::from_config(config(root.path())).unwrap();
        let path = root.path().join("out/proxies.json");
        orchestrator.write_proxy_map(&path).await.unwrap();
        let json: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json.get("/tests").is_some());
        assert!(json.get("/coverage").is_some());
    }

    #[tokio::test]
    async fn test_second_run_leaves_live_run_directories_alone() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src/app.js"), "var x = 1;").unwrap();
        let shared = |instance: &str| {
            let mut cfg = config(root.path());
            cfg.instance_id = Some(instance.to_string());
            cfg.instrument = InstrumentSetting::Enabled(true);
            cfg.source_dirs = vec![DirectoryDefinition::new("src", "src")].into();
            cfg
        };
        let first = LifecycleOrchestrator::from_config(shared("run-a")).unwrap();
        let second = LifecycleOrchestrator::from_config(shared("run-b")).unwrap();
        assert_eq!(first.layout().temp_root, second.layout().temp_root);

        assert!(first.runner_starting().await.is_success());
        let stray = first.layout().temp_root.join("testem-4242-stray");
        std::fs::create_dir_all(&stray).unwrap();

        assert!(second.runner_starting().await.is_success());
        assert!(first.layout().coverage_dir.is_dir());
        assert!(first.layout().instrumented_dir.join("src/app.js").is_file());
        assert!(first.layout().testem_dir.is_dir());
        assert!(!stray.exists());
        assert_eq!(first.server().state(), FixtureState::Started);

        assert!(second.runner_exiting().await.is_success());
        assert!(first.layout().coverage_dir.is_dir());
        assert!(first.runner_exiting().await.is_success());
        assert!(!first.layout().coverage_dir.exists());
    }

    #[tokio::test]
    async fn test_testem_dir_failure_releases_started_listeners() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("blocker"), "not a directory").unwrap();
        let mut cfg = config(root.path());
        cfg.testem_dir = Some(root.path().join("blocker/testem").to_string_lossy().into_owned());
        let orchestrator = LifecycleOrchestrator::from_config(cfg).unwrap();

        let outcome = orchestrator.runner_starting().await;
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.step, STEP_CONSTRUCT_FIXTURES);
        assert!(matches!(failure.error, HarnessError::Io(_)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orchestrator.server().started().listener_count(), 0);
        assert_eq!(orchestrator.server().state(), FixtureState::Registered);
        assert!(orchestrator.runner_exiting().await.is_success());
    }
}
