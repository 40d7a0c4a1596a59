use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use taskloom::errors::Result as LoomResult;
use taskloom::{
    ArtifactSeed, DispatchSink, ProcessId, ProcessRecord, ProcessStore, Runner, RunnerContext,
    TransientFailure,
};

/// Scripted outcome for one `execute` call.
#[derive(Debug, Clone)]
pub enum ExecuteScript {
    Succeed,
    FailTransient(String),
    FailPermanent(String),
    /// Pend forever; only a stop/cancel lets `run_process` return.
    BlockUntilCancelled,
}

/// A fake runner that:
/// - records which processes were prepared, executed, and evented
/// - plays back scripted outcomes in order (defaulting to success).
#[derive(Default)]
pub struct FakeRunner {
    prepared: Mutex<Vec<ProcessId>>,
    executed: Mutex<Vec<ProcessId>>,
    events: Mutex<Vec<(ProcessId, serde_json::Value)>>,
    outcomes: Mutex<VecDeque<ExecuteScript>>,
    fail_prepare: AtomicBool,
    emit_outputs: AtomicBool,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an outcome for the next unscripted `execute` call.
    pub fn push_outcome(&self, outcome: ExecuteScript) {
        self.outcomes
            .lock()
            .expect("outcomes poisoned")
            .push_back(outcome);
    }

    /// Make every subsequent `prepare` call fail until switched back.
    pub fn fail_prepare(&self, enabled: bool) {
        self.fail_prepare.store(enabled, Ordering::SeqCst);
    }

    /// Have each successful `execute` attach one output artifact to the
    /// owning run, the way real runners publish results.
    pub fn emit_outputs(&self, enabled: bool) {
        self.emit_outputs.store(enabled, Ordering::SeqCst);
    }

    pub fn prepared_ids(&self) -> Vec<ProcessId> {
        self.prepared.lock().expect("prepared poisoned").clone()
    }

    pub fn executed_ids(&self) -> Vec<ProcessId> {
        self.executed.lock().expect("executed poisoned").clone()
    }

    pub fn event_payloads(&self) -> Vec<(ProcessId, serde_json::Value)> {
        self.events.lock().expect("events poisoned").clone()
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn prepare(
        &self,
        _ctx: &RunnerContext,
        process: &ProcessRecord,
    ) -> anyhow::Result<()> {
        self.prepared
            .lock()
            .expect("prepared poisoned")
            .push(process.id);
        if self.fail_prepare.load(Ordering::SeqCst) {
            anyhow::bail!("scripted preparation failure");
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &RunnerContext,
        process: &ProcessRecord,
    ) -> anyhow::Result<()> {
        self.executed
            .lock()
            .expect("executed poisoned")
            .push(process.id);

        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes poisoned")
            .pop_front()
            .unwrap_or(ExecuteScript::Succeed);

        match outcome {
            ExecuteScript::Succeed => {
                if self.emit_outputs.load(Ordering::SeqCst) {
                    let mut run = ctx.store.run(process.run_id).await?;
                    let artifact = ctx
                        .store
                        .insert_artifact(ArtifactSeed {
                            task_def_id: Some(run.task_def_id),
                            parent_id: None,
                        })
                        .await?;
                    run.output_artifacts.push(artifact.id);
                    ctx.store.save_run(run).await?;
                }
                Ok(())
            }
            ExecuteScript::FailTransient(message) => {
                Err(anyhow::Error::new(TransientFailure(message)))
            }
            ExecuteScript::FailPermanent(message) => Err(anyhow::anyhow!(message)),
            ExecuteScript::BlockUntilCancelled => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn on_event(
        &self,
        _ctx: &RunnerContext,
        process: &ProcessRecord,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("events poisoned")
            .push((process.id, payload));
        Ok(())
    }
}

/// A dispatch sink that records dispatched batches for assertions instead of
/// pushing to a queue.
#[derive(Default)]
pub struct RecordingSink {
    dispatched: Arc<Mutex<Vec<ProcessId>>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything dispatched since the last call.
    pub fn take(&self) -> Vec<ProcessId> {
        std::mem::take(&mut *self.dispatched.lock().expect("sink poisoned"))
    }
}

impl DispatchSink for RecordingSink {
    fn dispatch(
        &self,
        processes: Vec<ProcessId>,
    ) -> Pin<Box<dyn Future<Output = LoomResult<()>> + Send + '_>> {
        let dispatched = Arc::clone(&self.dispatched);
        Box::pin(async move {
            dispatched.lock().expect("sink poisoned").extend(processes);
            Ok(())
        })
    }
}

/// A sink that always errors, for exercising propagation paths.
#[derive(Default)]
pub struct FailingSink;

impl DispatchSink for FailingSink {
    fn dispatch(
        &self,
        _processes: Vec<ProcessId>,
    ) -> Pin<Box<dyn Future<Output = LoomResult<()>> + Send + '_>> {
        Box::pin(async { Err(anyhow::anyhow!("sink unavailable").into()) })
    }
}
