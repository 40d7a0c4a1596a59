// src/engine/mod.rs

//! Orchestration engine for taskloom.
//!
//! [`Engine`] is the single entry point job-queue consumers and request
//! handlers call into. Its operations are grouped by the state machine they
//! own:
//! - [`lifecycle`]: transitions of a single process (prepare, run, complete,
//!   fail, stop, resume, restart, timeout),
//! - [`run`]: transitions of a run and coordination of its child processes,
//! - [`dispatch`]: slot-aware selection of the next processes to launch,
//! - [`workflow`]: starting runs for downstream workflow nodes.
//!
//! The engine decides *whether* work may execute; *how* dispatched work
//! reaches an executor is behind [`DispatchSink`], so production can push to
//! a job queue while tests record and short-circuit.

pub mod dispatch;
pub mod lifecycle;
pub mod run;
pub mod workflow;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::lock::MutexService;
use crate::model::TaskDefinition;
use crate::runner::{ErrorClassifier, Runner, RunnerContext, RunnerRegistry, TransientMarkerClassifier};
use crate::store::ProcessStore;
use crate::types::{ProcessId, RunId, WorkerContext, WorkflowRunId};

/// Trait abstracting how dispatched processes reach execution.
///
/// The engine marks processes dispatched under the appropriate mutex, then
/// hands their ids here *after* releasing it. Production pushes onto a job
/// queue whose consumers call [`Engine::run_process`]; tests can record the
/// batch or execute inline.
pub trait DispatchSink: Send + Sync {
    fn dispatch(
        &self,
        processes: Vec<ProcessId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production sink: forwards dispatched process ids over an mpsc channel to
/// whatever consumer loop the embedder runs.
pub struct ChannelDispatchSink {
    tx: mpsc::Sender<ProcessId>,
}

impl ChannelDispatchSink {
    pub fn new(tx: mpsc::Sender<ProcessId>) -> Self {
        Self { tx }
    }
}

impl DispatchSink for ChannelDispatchSink {
    fn dispatch(
        &self,
        processes: Vec<ProcessId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        // Clone the sender so the future doesn't borrow `self` across `await`.
        let tx = self.tx.clone();

        Box::pin(async move {
            for id in processes {
                tx.send(id).await.map_err(anyhow::Error::from)?;
            }
            Ok(())
        })
    }
}

/// At most one cancellation channel per process; `run_process` registers one
/// before executing, stop/timeout/restart fire it to interrupt in-flight
/// work cooperatively.
#[derive(Default)]
pub(crate) struct CancelRegistry {
    senders: Mutex<HashMap<ProcessId, oneshot::Sender<()>>>,
}

impl CancelRegistry {
    pub(crate) fn register(&self, id: ProcessId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut senders = self.senders.lock().expect("cancel registry poisoned");
        if senders.insert(id, tx).is_some() {
            debug!(process = %id, "replacing stale cancellation channel");
        }
        rx
    }

    pub(crate) fn clear(&self, id: ProcessId) {
        self.senders
            .lock()
            .expect("cancel registry poisoned")
            .remove(&id);
    }

    /// Request interruption of in-flight work. Returns whether a live
    /// execution was signalled.
    pub(crate) fn cancel(&self, id: ProcessId) -> bool {
        let sender = self
            .senders
            .lock()
            .expect("cancel registry poisoned")
            .remove(&id);
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn ProcessStore>,
    pub(crate) locks: MutexService,
    pub(crate) runners: RunnerRegistry,
    pub(crate) classifier: Arc<dyn ErrorClassifier>,
    pub(crate) sink: Arc<dyn DispatchSink>,
    pub(crate) cancels: CancelRegistry,
}

/// The orchestration engine. Cheap to clone; clones share all state, so
/// every queue consumer can hold one.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine with the default error classifier.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ProcessStore>,
        runners: RunnerRegistry,
        sink: Arc<dyn DispatchSink>,
    ) -> Result<Self> {
        Self::with_classifier(config, store, runners, sink, Arc::new(TransientMarkerClassifier))
    }

    /// Build an engine with a custom retryability policy.
    pub fn with_classifier(
        config: EngineConfig,
        store: Arc<dyn ProcessStore>,
        runners: RunnerRegistry,
        sink: Arc<dyn DispatchSink>,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                locks: MutexService::new(config.lock.clone()),
                runners,
                classifier,
                sink,
                cancels: CancelRegistry::default(),
            }),
        })
    }

    pub fn store(&self) -> Arc<dyn ProcessStore> {
        Arc::clone(&self.inner.store)
    }

    pub(crate) fn runner_for(&self, def: &TaskDefinition) -> Result<Arc<dyn Runner>> {
        self.inner.runners.resolve(&def.runner)
    }

    pub(crate) fn runner_ctx(&self, worker: &WorkerContext) -> RunnerContext {
        RunnerContext::new(self.store(), worker.clone())
    }

    /// Hand a dispatched batch to the sink. Errors propagate so queue
    /// consumers can apply their own alerting; every mutex is already
    /// released by the time this runs.
    pub(crate) async fn push_to_sink(&self, batch: Vec<ProcessId>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!(count = batch.len(), "handing dispatched processes to sink");
        self.inner.sink.dispatch(batch).await
    }

    /// Fire-and-forget dispatch trigger: completion of one process is a
    /// signal to look for more work, not part of the completion contract.
    pub(crate) async fn dispatch_signal(&self, run_id: RunId) {
        if let Err(error) = self.dispatch_for_run(run_id).await {
            warn!(run = %run_id, error = %error, "dispatch signal failed");
        }
    }
}

pub(crate) fn run_key(id: RunId) -> String {
    format!("run:{id}")
}

pub(crate) fn workflow_key(id: WorkflowRunId) -> String {
    format!("workflow:{id}")
}

pub(crate) fn process_key(id: ProcessId) -> String {
    format!("process:{id}")
}
