use std::sync::Arc;

use chrono::{Duration, Utc};
use taskloom::errors::Result as LoomResult;
use taskloom::{
    ArtifactId, ArtifactSeed, Engine, EngineConfig, MemoryStore, ProcessId, ProcessStore,
    RunnerRegistry, TaskDefId, TaskDefinition, WorkerContext,
};

use crate::fake_runner::{FakeRunner, RecordingSink};

/// Fully wired engine over the in-memory store, fake runner, and recording
/// sink. The default setup every integration test starts from.
pub struct TestHarness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub runner: Arc<FakeRunner>,
    pub sink: Arc<RecordingSink>,
}

impl TestHarness {
    pub fn new() -> Self {
        crate::init_tracing();
        let store = Arc::new(MemoryStore::new());
        let runner = FakeRunner::new();
        let sink = RecordingSink::new();
        let registry = RunnerRegistry::new().register("fake", runner.clone());
        let engine = Engine::new(
            EngineConfig::default(),
            store.clone(),
            registry,
            sink.clone(),
        )
        .expect("default engine config is valid");
        Self {
            engine,
            store,
            runner,
            sink,
        }
    }

    pub async fn register(&self, def: &TaskDefinition) {
        self.store
            .insert_task_definition(def.clone())
            .await
            .expect("insert task definition");
    }

    pub async fn artifact(&self, owner: Option<TaskDefId>) -> ArtifactId {
        self.store
            .insert_artifact(ArtifactSeed {
                task_def_id: owner,
                parent_id: None,
            })
            .await
            .expect("insert artifact")
            .id
    }

    /// Execute everything the sink has dispatched, looping until completion
    /// signals stop producing new dispatches. Returns processes in the
    /// order they were executed.
    pub async fn drive(&self) -> LoomResult<Vec<ProcessId>> {
        let ctx = WorkerContext::for_job("test-driver");
        let mut ran = Vec::new();
        loop {
            let batch = self.sink.take();
            if batch.is_empty() {
                break;
            }
            for id in batch {
                self.engine.run_process(id, &ctx).await?;
                ran.push(id);
            }
        }
        Ok(ran)
    }

    /// Rewind a process's `started_at` so the timeout sweep sees it as
    /// overdue.
    pub async fn backdate_started(&self, id: ProcessId, seconds: i64) {
        let mut process = self.store.process(id).await.expect("process exists");
        process.started_at = Some(Utc::now() - Duration::seconds(seconds));
        self.store
            .save_process(process)
            .await
            .expect("save process");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
