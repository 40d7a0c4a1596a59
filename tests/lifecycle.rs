// tests/lifecycle.rs

//! Process lifecycle behaviour: failure classification, idempotent
//! completion, stop/resume, and the at-most-one-active-execution guarantee.

use std::time::Duration;

use taskloom::{ProcessStatus, ProcessStore, TaskloomError, WorkerContext};
use taskloom_test_utils::builders::TaskDefBuilder;
use taskloom_test_utils::fake_runner::ExecuteScript;
use taskloom_test_utils::harness::TestHarness;
use taskloom_test_utils::with_timeout;

#[tokio::test]
async fn completing_twice_leaves_state_identical() {
    let h = TestHarness::new();
    let def = TaskDefBuilder::new("ingest").build();
    h.register(&def).await;

    let run = h
        .engine
        .start_run(def.id, Vec::new(), &WorkerContext::default())
        .await
        .unwrap();
    h.drive().await.unwrap();

    let processes = h.store.processes_of_run(run.id).await.unwrap();
    assert_eq!(processes.len(), 1);
    let id = processes[0].id;

    let before = h.store.process(id).await.unwrap();
    assert_eq!(before.status(), ProcessStatus::Completed);

    h.engine.complete_process(id).await.unwrap();
    let after = h.store.process(id).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn transient_failure_marks_incomplete_and_reraises() {
    let h = TestHarness::new();
    let def = TaskDefBuilder::new("fetch").build();
    h.register(&def).await;

    h.runner
        .push_outcome(ExecuteScript::FailTransient("connection reset".to_string()));
    let run = h
        .engine
        .start_run(def.id, Vec::new(), &WorkerContext::default())
        .await
        .unwrap();

    let batch = h.sink.take();
    assert_eq!(batch.len(), 1);
    let err = h
        .engine
        .run_process(batch[0], &WorkerContext::for_job("job-17"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let process = h.store.process(batch[0]).await.unwrap();
    assert_eq!(process.status(), ProcessStatus::Incomplete);
    assert_eq!(process.error_count, 1);
    assert_eq!(process.invoked_by.as_deref(), Some("job-17"));

    let run = h.store.run(run.id).await.unwrap();
    assert_eq!(run.error_count, 1);
}

#[tokio::test]
async fn permanent_failure_marks_failed() {
    let h = TestHarness::new();
    let def = TaskDefBuilder::new("validate").build();
    h.register(&def).await;

    h.runner
        .push_outcome(ExecuteScript::FailPermanent("schema mismatch".to_string()));
    h.engine
        .start_run(def.id, Vec::new(), &WorkerContext::default())
        .await
        .unwrap();

    let batch = h.sink.take();
    let err = h
        .engine
        .run_process(batch[0], &WorkerContext::default())
        .await
        .unwrap_err();
    assert!(!err.is_retryable());

    let process = h.store.process(batch[0]).await.unwrap();
    assert_eq!(process.status(), ProcessStatus::Failed);
}

#[tokio::test]
async fn prepare_failure_marks_incomplete_and_reraises() {
    let h = TestHarness::new();
    let def = TaskDefBuilder::new("stage").build();
    h.register(&def).await;

    let run = h
        .engine
        .prepare_run(def.id, Vec::new(), &WorkerContext::default())
        .await
        .unwrap();

    h.runner.fail_prepare(true);
    let err = h
        .engine
        .prepare_process(run.id, None, &[], "extra", &WorkerContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskloomError::Execution { .. }));

    let processes = h.store.processes_of_run(run.id).await.unwrap();
    let failed = processes
        .iter()
        .find(|p| p.origin == "extra")
        .expect("failed preparation still creates a record");
    assert_eq!(failed.status(), ProcessStatus::Incomplete);
    assert!(!failed.is_ready);
}

#[tokio::test]
async fn resume_forces_genuine_reexecution() {
    let h = TestHarness::new();
    let def = TaskDefBuilder::new("retryable").build();
    h.register(&def).await;

    h.runner
        .push_outcome(ExecuteScript::FailTransient("flaky".to_string()));
    h.engine
        .start_run(def.id, Vec::new(), &WorkerContext::default())
        .await
        .unwrap();

    let batch = h.sink.take();
    let id = batch[0];
    let _ = h
        .engine
        .run_process(id, &WorkerContext::default())
        .await
        .unwrap_err();

    h.engine.resume_process(id).await.unwrap();
    let resumed = h.store.process(id).await.unwrap();
    assert_eq!(resumed.status(), ProcessStatus::Dispatched);
    assert!(resumed.started_at.is_none());
    assert!(resumed.incomplete_at.is_none());

    // Second execution succeeds this time.
    h.drive().await.unwrap();
    let done = h.store.process(id).await.unwrap();
    assert_eq!(done.status(), ProcessStatus::Completed);
    assert_eq!(h.runner.executed_ids().iter().filter(|p| **p == id).count(), 2);
}

#[tokio::test]
async fn resume_from_pending_is_a_conflict() {
    let h = TestHarness::new();
    let def = TaskDefBuilder::new("idle").build();
    h.register(&def).await;

    let run = h
        .engine
        .prepare_run(def.id, Vec::new(), &WorkerContext::default())
        .await
        .unwrap();
    let id = h.store.processes_of_run(run.id).await.unwrap()[0].id;

    let err = h.engine.resume_process(id).await.unwrap_err();
    assert!(matches!(err, TaskloomError::Conflict(_)));
}

#[tokio::test]
async fn stop_interrupts_running_process_and_is_idempotent() {
    with_timeout(async {
        let h = TestHarness::new();
        let def = TaskDefBuilder::new("long-haul").build();
        h.register(&def).await;

        h.runner.push_outcome(ExecuteScript::BlockUntilCancelled);
        h.engine
            .start_run(def.id, Vec::new(), &WorkerContext::default())
            .await
            .unwrap();
        let id = h.sink.take()[0];

        let engine = h.engine.clone();
        let worker = tokio::spawn(async move {
            engine.run_process(id, &WorkerContext::default()).await
        });

        // Wait until execution is actually in flight.
        while !h.runner.executed_ids().contains(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.engine.stop_process(id).await.unwrap();
        worker.await.unwrap().unwrap();

        let stopped = h.store.process(id).await.unwrap();
        assert_eq!(stopped.status(), ProcessStatus::Stopped);

        // Idempotent: a second stop changes nothing.
        h.engine.stop_process(id).await.unwrap();
        assert_eq!(h.store.process(id).await.unwrap(), stopped);
    })
    .await;
}

#[tokio::test]
async fn restarting_a_running_process_is_a_conflict() {
    with_timeout(async {
        let h = TestHarness::new();
        let def = TaskDefBuilder::new("busy").build();
        h.register(&def).await;

        h.runner.push_outcome(ExecuteScript::BlockUntilCancelled);
        h.engine
            .start_run(def.id, Vec::new(), &WorkerContext::default())
            .await
            .unwrap();
        let id = h.sink.take()[0];

        let engine = h.engine.clone();
        let worker = tokio::spawn(async move {
            engine.run_process(id, &WorkerContext::default()).await
        });
        while !h.runner.executed_ids().contains(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = h.engine.restart_process(id).await.unwrap_err();
        assert!(matches!(err, TaskloomError::Conflict(_)));

        h.engine.stop_process(id).await.unwrap();
        worker.await.unwrap().unwrap();
    })
    .await;
}

#[tokio::test]
async fn concurrent_run_calls_execute_at_most_once() {
    with_timeout(async {
        let h = TestHarness::new();
        let def = TaskDefBuilder::new("exclusive").build();
        h.register(&def).await;

        h.runner.push_outcome(ExecuteScript::BlockUntilCancelled);
        h.engine
            .start_run(def.id, Vec::new(), &WorkerContext::default())
            .await
            .unwrap();
        let id = h.sink.take()[0];

        let engine = h.engine.clone();
        let first = tokio::spawn(async move {
            engine.run_process(id, &WorkerContext::for_job("consumer-a")).await
        });
        while !h.runner.executed_ids().contains(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The second consumer sees a running process and no-ops.
        h.engine
            .run_process(id, &WorkerContext::for_job("consumer-b"))
            .await
            .unwrap();
        assert_eq!(h.runner.executed_ids().len(), 1);

        h.engine.stop_process(id).await.unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(h.runner.executed_ids().len(), 1);
    })
    .await;
}

#[tokio::test]
async fn runner_events_are_forwarded() {
    let h = TestHarness::new();
    let def = TaskDefBuilder::new("webhooked").build();
    h.register(&def).await;

    let run = h
        .engine
        .prepare_run(def.id, Vec::new(), &WorkerContext::default())
        .await
        .unwrap();
    let id = h.store.processes_of_run(run.id).await.unwrap()[0].id;

    h.engine
        .handle_runner_event(
            id,
            serde_json::json!({"resume_token": "abc"}),
            &WorkerContext::default(),
        )
        .await
        .unwrap();

    let events = h.runner.event_payloads();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, id);
    assert_eq!(events[0].1["resume_token"], "abc");
}
