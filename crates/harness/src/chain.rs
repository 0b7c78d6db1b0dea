//! Priority-ordered step chains.
//!
//! A chain is the list of listeners registered for one root event. Steps
//! are ordered once, when the chain is built, and run strictly one after
//! another; the first failing step short-circuits the rest.

use crate::priority::{order_by_priority, Prioritized, Priority};
use crate::result::{HarnessError, HarnessResult};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Boxed future produced by a step
pub type StepFuture = BoxFuture<'static, HarnessResult<()>>;

/// A step body
pub type StepFn = Arc<dyn Fn() -> StepFuture + Send + Sync>;

/// The step that failed and why
#[derive(Debug)]
pub struct StepFailure {
    /// Step name
    pub step: String,
    /// Error returned by the step
    pub error: HarnessError,
}

/// How a chain settled
#[derive(Debug)]
pub struct ChainOutcome {
    /// Chain name
    pub chain: String,
    /// Steps that completed, in order
    pub completed: Vec<String>,
    /// First failure, if any
    pub failure: Option<StepFailure>,
    /// Wall time spent in the chain
    pub elapsed: Duration,
}

impl ChainOutcome {
    /// Outcome of a chain that could not run at all
    #[must_use]
    pub fn aborted(chain: impl Into<String>, step: impl Into<String>, error: HarnessError) -> Self {
        Self {
            chain: chain.into(),
            completed: Vec::new(),
            failure: Some(StepFailure {
                step: step.into(),
                error,
            }),
            elapsed: Duration::ZERO,
        }
    }

    /// True when every step resolved
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Builder collecting steps before ordering them
pub struct ChainBuilder {
    name: String,
    steps: Vec<Prioritized<StepFn>>,
}

impl fmt::Debug for ChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainBuilder")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ChainBuilder {
    /// Start a chain for the named root event
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Register a step
    #[must_use]
    pub fn step<F, Fut>(mut self, name: impl Into<String>, priority: Priority, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HarnessResult<()>> + Send + 'static,
    {
        let body: StepFn = Arc::new(move || -> StepFuture { Box::pin(f()) });
        self.steps.push(Prioritized::new(name, priority, body));
        self
    }

    /// Register an already boxed step
    #[must_use]
    pub fn boxed_step(mut self, name: impl Into<String>, priority: Priority, body: StepFn) -> Self {
        self.steps.push(Prioritized::new(name, priority, body));
        self
    }

    /// Resolve priorities and freeze the order
    pub fn build(self) -> HarnessResult<StepChain> {
        let ordered = order_by_priority(self.steps)?;
        let steps: Vec<(String, StepFn)> = ordered.into_iter().map(|e| (e.name, e.item)).collect();
        debug!(
            chain = %self.name,
            order = %steps.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(" -> "),
            "chain assembled"
        );
        Ok(StepChain {
            name: self.name,
            steps,
        })
    }
}

/// An ordered, runnable chain of steps
pub struct StepChain {
    name: String,
    steps: Vec<(String, StepFn)>,
}

impl fmt::Debug for StepChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepChain")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl StepChain {
    /// Chain name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in execution order
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Run every step in order, stopping at the first failure
    pub async fn run(&self) -> ChainOutcome {
        let started = Instant::now();
        let mut completed = Vec::with_capacity(self.steps.len());

        for (step, body) in &self.steps {
            debug!(chain = %self.name, step = %step, "step starting");
            if let Err(error) = body().await {
                warn!(chain = %self.name, step = %step, error = %error, "step failed, abandoning chain");
                return ChainOutcome {
                    chain: self.name.clone(),
                    completed,
                    failure: Some(StepFailure {
                        step: step.clone(),
                        error,
                    }),
                    elapsed: started.elapsed(),
                };
            }
            completed.push(step.clone());
        }

        info!(
            chain = %self.name,
            steps = completed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chain resolved"
        );
        ChainOutcome {
            chain: self.name.clone(),
            completed,
            failure: None,
            elapsed: started.elapsed(),
        }
    }
}
