//! testem-harness: lifecycle orchestration and coverage collection for
//! in-browser test runs.
//!
//! The harness sits between an external browser test runner and the code
//! under test. It stages (optionally instrumented) sources, serves them
//! together with the test pages, collects the coverage reports browsers
//! upload, and writes a summary once the run is over.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  LifecycleOrchestrator                           │
//! │  on_runner_ready ──► cleanup ─► constructFixtures ─► waitFor...  │
//! │  on_runner_exit  ──► stopServer ─► waitFor... ─► report ─► clean │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   ┌──────────────┐   ┌───────────────┐   ┌──────────────────┐    │
//! │   │ Instrumenter │──►│ ContentServer │◄──│ browser (runner) │    │
//! │   └──────────────┘   │  + Coverage   │   └──────────────────┘    │
//! │                      │    Receiver   │──► coverage-*.json        │
//! │                      └───────────────┘          │                │
//! │                                                 ▼                │
//! │                                             Reporter             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use testem_harness::{DirectoryDefinition, HarnessConfig, LifecycleOrchestrator};
//!
//! # async fn run() -> testem_harness::HarnessResult<()> {
//! let config = HarnessConfig::builder()
//!     .package("app", "/work/app")
//!     .source_dir(DirectoryDefinition::new("src", "%app/src"))
//!     .content_dir(DirectoryDefinition::new("tests", "%app/tests"))
//!     .build()?;
//! let orchestrator = LifecycleOrchestrator::from_config(config)?;
//!
//! let ready = orchestrator.runner_starting().await;
//! assert!(ready.is_success());
//! println!("{}", orchestrator.proxy_map().to_json_pretty()?);
//! orchestrator.runner_exiting().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]

mod chain;
mod cleanup;
/// Configuration file format and run layout
pub mod config;
mod coverage;
mod event;
mod fixture;
mod instrument;
mod orchestrator;
mod paths;
mod priority;
mod proxy;
#[allow(clippy::cast_precision_loss)]
mod reporter;
mod result;
mod server;

pub use chain::{ChainBuilder, ChainOutcome, StepChain, StepFailure, StepFn, StepFuture};
pub use cleanup::{
    CleanupDefinition, CleanupPlan, CleanupReport, CleanupSequencer, CleanupStage,
    DEFAULT_SCRATCH_PATTERN,
};
pub use config::{HarnessConfig, HarnessConfigBuilder, RunLayout};
pub use coverage::{
    classify_user_agent, coverage_router, filename_from_url, BrowserInfo, CoverageFileName,
    CoverageReceiver, CoverageUpload, DocumentInfo, NavigatorInfo, DEFAULT_COVERAGE_PATH,
    DEFAULT_MAX_UPLOAD_BYTES,
};
pub use event::{
    wait_for_all, wait_with_timeout, EventListener, LifecycleEvent,
    DEFAULT_WRAPPED_EVENT_TIMEOUT_MS,
};
pub use fixture::{Fixture, FixtureSet, FixtureState};
pub use instrument::{
    instrument_all, CommandInstrumenter, CopyInstrumenter, InstrumentOptions, Instrumenter,
};
pub use orchestrator::{
    LifecycleOrchestrator, OrchestratorBuilder, OrchestratorEvents, Phase, RUNNER_EXITING,
    RUNNER_STARTING, STEP_CLEANUP, STEP_CONSTRUCT_FIXTURES, STEP_COVERAGE_REPORT,
    STEP_STOP_SERVER, STEP_WAIT_FOR_FIXTURES,
};
pub use paths::{default_suffix, normalize, unique_dir_name, PathResolver, PACKAGE_PREFIX};
pub use priority::{order_by_priority, Prioritized, Priority};
pub use proxy::{DirectoryDefinition, ProxyMap, ProxyPathBuilder, ProxyTarget, ResolvedDirectory};
pub use reporter::{
    CommandReporter, CoverageMap, CoverageSummary, FileCoverage, FileSummary, Metric,
    ReportOutcome, Reporter, SummaryReporter, SUMMARY_JSON, SUMMARY_TEXT,
};
pub use result::{HarnessError, HarnessResult};
pub use server::{
    ContentServer, InstrumentationPlan, ServerConfig, CONTENT_SERVER_NAME, DEFAULT_COVERAGE_PORT,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::config::{BuiltinReport, InstrumentSetting, ReportSetting};
    pub use super::{
        CleanupDefinition, CleanupStage, ContentServer, DirectoryDefinition, Fixture,
        HarnessConfig, HarnessError, HarnessResult, LifecycleEvent, LifecycleOrchestrator,
        Priority, ProxyMap, Reporter,
    };
}
