// tests/queue_consumer.rs

//! End-to-end through the production channel sink: the engine pushes
//! dispatched process ids onto an mpsc queue and a consumer loop dequeues
//! and executes them, the way an external job-queue worker would.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use taskloom::{
    ChannelDispatchSink, Engine, EngineConfig, MemoryStore, ProcessId, ProcessStore, RunStatus,
    RunnerRegistry, WorkerContext,
};
use taskloom_test_utils::builders::TaskDefBuilder;
use taskloom_test_utils::fake_runner::FakeRunner;
use taskloom_test_utils::{init_tracing, with_timeout};

#[tokio::test]
async fn channel_sink_feeds_a_consumer_loop() {
    with_timeout(async {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        let runner = FakeRunner::new();
        let registry = RunnerRegistry::new().register("fake", runner.clone());
        let (tx, mut rx) = mpsc::channel::<ProcessId>(16);
        let engine = Engine::new(
            EngineConfig::default(),
            store.clone(),
            registry,
            Arc::new(ChannelDispatchSink::new(tx)),
        )
        .unwrap();

        let def = TaskDefBuilder::new("queued")
            .max_workers(2)
            .worker("w1")
            .worker("w2")
            .worker("w3")
            .build();
        store.insert_task_definition(def.clone()).await.unwrap();

        let consumer_engine = engine.clone();
        let consumer = tokio::spawn(async move {
            let ctx = WorkerContext::for_job("consumer-1");
            while let Some(id) = rx.recv().await {
                consumer_engine.run_process(id, &ctx).await.unwrap();
            }
        });

        let run = engine
            .start_run(def.id, Vec::new(), &WorkerContext::default())
            .await
            .unwrap();

        while store.run(run.id).await.unwrap().status() != RunStatus::Completed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.executed_ids().len(), 3);

        consumer.abort();
    })
    .await;
}
