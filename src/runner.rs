// src/runner.rs

//! Pluggable runner abstraction.
//!
//! The engine never knows what a process actually does; it talks to a
//! [`Runner`] resolved from the [`RunnerRegistry`] by the task definition's
//! declared runner key. Production registers real implementations at
//! startup; tests register fakes that record calls and script outcomes.
//!
//! Failure meaning is also pluggable: the engine asks an
//! [`ErrorClassifier`] whether a runner error is transient (retryable) or a
//! permanent business-rule violation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{Result, TaskloomError, TransientFailure};
use crate::model::ProcessRecord;
use crate::store::ProcessStore;
use crate::types::{ArtifactId, WorkerContext};

/// What a runner gets to work with: the store for reading/writing its own
/// artifacts, and the identity of the invoking job for audit.
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<dyn ProcessStore>,
    pub worker: WorkerContext,
}

impl RunnerContext {
    pub fn new(store: Arc<dyn ProcessStore>, worker: WorkerContext) -> Self {
        Self { store, worker }
    }
}

/// Per-work-type strategy implementing the actual work of a process.
///
/// All methods raise `anyhow::Error` on failure; the engine records
/// lifecycle state and classifies retryability, it never interprets the
/// error beyond that.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Validate configuration and stage whatever `execute` needs.
    async fn prepare(&self, ctx: &RunnerContext, process: &ProcessRecord) -> anyhow::Result<()>;

    /// Perform the work. May run for a long time; the engine holds no lock
    /// while this is in flight.
    async fn execute(&self, ctx: &RunnerContext, process: &ProcessRecord) -> anyhow::Result<()>;

    /// Externally-triggered continuation (e.g. a webhook resuming a waiting
    /// process).
    async fn on_event(
        &self,
        ctx: &RunnerContext,
        process: &ProcessRecord,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Split a run's input artifacts into per-process groups. The default
    /// keeps them together as a single group.
    async fn partition(
        &self,
        _ctx: &RunnerContext,
        inputs: &[ArtifactId],
    ) -> anyhow::Result<Vec<Vec<ArtifactId>>> {
        Ok(vec![inputs.to_vec()])
    }
}

/// Capability-keyed registry mapping a task definition's declared runner
/// identifier to an implementation. Populated once at startup; lookups of
/// unknown keys are validation errors, never dynamic name construction.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, key: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        self.runners.insert(key.into(), runner);
        self
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<dyn Runner>> {
        self.runners.get(key).cloned().ok_or_else(|| {
            TaskloomError::Validation(format!("no runner registered for key '{key}'"))
        })
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("keys", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Distinguishes transient infrastructure errors from permanent
/// business-logic errors.
pub trait ErrorClassifier: Send + Sync {
    fn is_retryable(&self, error: &anyhow::Error) -> bool;
}

/// Default classifier: an error is retryable iff its chain contains a
/// [`TransientFailure`] marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientMarkerClassifier;

impl ErrorClassifier for TransientMarkerClassifier {
    fn is_retryable(&self, error: &anyhow::Error) -> bool {
        error
            .chain()
            .any(|cause| cause.downcast_ref::<TransientFailure>().is_some())
    }
}
