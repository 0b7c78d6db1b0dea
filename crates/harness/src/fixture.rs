//! Fixture management.
//!
//! A fixture is one of the running pieces a test run needs before the
//! runner can load pages: the content server, and anything else a caller
//! registers. Fixtures start in priority order and stop in reverse.

use crate::event::LifecycleEvent;
use crate::priority::{order_by_priority, Prioritized, Priority};
use crate::result::HarnessResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// State of a fixture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixtureState {
    /// Created but never started
    #[default]
    Registered,
    /// Running
    Started,
    /// Stopped after running
    Stopped,
    /// Start failed
    Failed,
}

/// A process or service that must be up while the runner executes.
///
/// Implementations use interior mutability; the orchestrator shares them
/// behind `Arc`.
#[async_trait]
pub trait Fixture: Send + Sync {
    /// Name used in logs and priority references
    fn name(&self) -> &str;

    /// Position among sibling fixtures
    fn priority(&self) -> Priority {
        Priority::Unordered
    }

    /// Bring the fixture up.
    ///
    /// # Errors
    ///
    /// Returns an error if the fixture cannot start; the startup chain is
    /// abandoned.
    async fn start(&self) -> HarnessResult<()>;

    /// Bring the fixture down. Stopping a fixture that is not running
    /// succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails.
    async fn stop(&self) -> HarnessResult<()>;

    /// Fired once the fixture is ready for traffic
    fn started(&self) -> LifecycleEvent<()>;

    /// Fired once the fixture has gone away
    fn stopped(&self) -> LifecycleEvent<()>;

    /// Current state
    fn state(&self) -> FixtureState;
}

/// Fixtures in start order
#[derive(Clone, Default)]
pub struct FixtureSet {
    fixtures: Vec<Arc<dyn Fixture>>,
}

impl fmt::Debug for FixtureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureSet")
            .field("fixtures", &self.names())
            .finish()
    }
}

impl FixtureSet {
    /// Order fixtures by their declared priorities
    pub fn new(fixtures: Vec<Arc<dyn Fixture>>) -> HarnessResult<Self> {
        let entries = fixtures
            .into_iter()
            .map(|f| Prioritized::new(f.name().to_string(), f.priority(), f))
            .collect();
        let fixtures = order_by_priority(entries)?
            .into_iter()
            .map(|e| e.item)
            .collect();
        Ok(Self { fixtures })
    }

    /// Number of fixtures
    #[must_use]
    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    /// True when no fixture is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    /// Names in start order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.fixtures.iter().map(|f| f.name()).collect()
    }

    /// Start every fixture in order.
    ///
    /// # Errors
    ///
    /// Returns the first start error. Fixtures that were already started
    /// are stopped again before returning.
    pub async fn start_all(&self) -> HarnessResult<()> {
        for (index, fixture) in self.fixtures.iter().enumerate() {
            fixture.started().reset();
            fixture.stopped().reset();
            if let Err(error) = fixture.start().await {
                warn!(fixture = fixture.name(), error = %error, "fixture failed to start");
                for earlier in self.fixtures[..index].iter().rev() {
                    if let Err(stop_error) = earlier.stop().await {
                        warn!(fixture = earlier.name(), error = %stop_error, "fixture failed to stop after aborted startup");
                    }
                }
                return Err(error);
            }
            info!(fixture = fixture.name(), "fixture started");
        }
        Ok(())
    }

    /// Stop every fixture in reverse order.
    ///
    /// # Errors
    ///
    /// Every fixture is attempted; the first error is returned.
    pub async fn stop_all(&self) -> HarnessResult<()> {
        let mut first_error = None;
        for fixture in self.fixtures.iter().rev() {
            match fixture.stop().await {
                Ok(()) => info!(fixture = fixture.name(), "fixture stopped"),
                Err(error) => {
                    warn!(fixture = fixture.name(), error = %error, "fixture failed to stop");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Started events, one per fixture
    #[must_use]
    pub fn started_events(&self) -> Vec<LifecycleEvent<()>> {
        self.fixtures.iter().map(|f| f.started()).collect()
    }

    /// Stopped events of the fixtures that are currently running
    #[must_use]
    pub fn running_stopped_events(&self) -> Vec<LifecycleEvent<()>> {
        self.fixtures
            .iter()
            .filter(|f| f.state() == FixtureState::Started)
            .map(|f| f.stopped())
            .collect()
    }
}
