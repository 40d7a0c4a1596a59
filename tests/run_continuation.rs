// tests/run_continuation.rs

//! Run-level lifecycle: stop/resume cascades and restart with re-derived
//! inputs.

use taskloom::{ProcessStatus, ProcessStore, RunStatus, TaskloomError, WorkerContext};
use taskloom_test_utils::builders::{TaskDefBuilder, WorkflowSeedBuilder};
use taskloom_test_utils::harness::TestHarness;

#[tokio::test]
async fn stop_and_resume_cascade_to_children() {
    let h = TestHarness::new();
    let ctx = WorkerContext::default();
    let def = TaskDefBuilder::new("pausable")
        .max_workers(2)
        .worker("w1")
        .worker("w2")
        .build();
    h.register(&def).await;

    let run = h.engine.start_run(def.id, Vec::new(), &ctx).await.unwrap();
    let dispatched = h.sink.take();
    assert_eq!(dispatched.len(), 2);

    h.engine.stop_run(run.id).await.unwrap();
    assert_eq!(h.store.run(run.id).await.unwrap().status(), RunStatus::Stopped);
    for id in &dispatched {
        assert_eq!(
            h.store.process(*id).await.unwrap().status(),
            ProcessStatus::Stopped
        );
    }

    // Stopped children refuse to execute even if a consumer already
    // dequeued them.
    h.engine.run_process(dispatched[0], &ctx).await.unwrap();
    assert!(h.runner.executed_ids().is_empty());

    // Stopping twice is a no-op.
    h.engine.stop_run(run.id).await.unwrap();

    h.engine.resume_run(run.id).await.unwrap();
    let resumed = h.store.run(run.id).await.unwrap();
    assert_ne!(resumed.status(), RunStatus::Stopped);

    // Children return to pending and get re-dispatched.
    let redispatched = h.sink.take();
    assert_eq!(redispatched.len(), 2);
    for id in &redispatched {
        assert_eq!(
            h.store.process(*id).await.unwrap().status(),
            ProcessStatus::Dispatched
        );
    }

    for id in &redispatched {
        h.engine.run_process(*id, &ctx).await.unwrap();
    }
    h.drive().await.unwrap();
    assert_eq!(h.store.run(run.id).await.unwrap().status(), RunStatus::Completed);
}

#[tokio::test]
async fn resume_of_an_active_run_is_a_conflict() {
    let h = TestHarness::new();
    let ctx = WorkerContext::default();
    let def = TaskDefBuilder::new("active").build();
    h.register(&def).await;

    let run = h.engine.start_run(def.id, Vec::new(), &ctx).await.unwrap();
    let err = h.engine.resume_run(run.id).await.unwrap_err();
    assert!(matches!(err, TaskloomError::Conflict(_)));
}

#[tokio::test]
async fn restart_rebuilds_processes_and_rederives_workflow_inputs() {
    let h = TestHarness::new();
    h.runner.emit_outputs(true);
    let ctx = WorkerContext::default();

    let def_a = TaskDefBuilder::new("upstream").build();
    let def_b = TaskDefBuilder::new("downstream").build();
    h.register(&def_a).await;
    h.register(&def_b).await;

    let mut seed = WorkflowSeedBuilder::new("restartable-chain", 2);
    let a = seed.node("a", &def_a);
    let b = seed.node("b", &def_b);
    seed.edge(a, b);

    let workflow = h.engine.start_workflow(seed.build(), Vec::new(), &ctx).await.unwrap();
    h.drive().await.unwrap();

    let nodes = h.store.workflow_nodes(workflow.id).await.unwrap();
    let node_a = nodes.iter().find(|n| n.name == "a").unwrap().id;
    let node_b = nodes.iter().find(|n| n.name == "b").unwrap().id;
    let run_a = h.store.run_for_node(node_a).await.unwrap().unwrap();
    let run_b = h.store.run_for_node(node_b).await.unwrap().unwrap();
    assert_eq!(run_b.status(), RunStatus::Completed);
    let old_process_ids: Vec<_> = h
        .store
        .processes_of_run(run_b.id)
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();

    h.engine.restart_run(run_b.id, &ctx).await.unwrap();

    let restarted = h.store.run(run_b.id).await.unwrap();
    assert_ne!(restarted.status(), RunStatus::Completed);
    assert!(restarted.output_artifacts.is_empty());
    // Inputs re-collected from the still-completed upstream node.
    assert_eq!(restarted.input_artifacts, run_a.output_artifacts);

    // Old processes are gone, replaced by a fresh partition.
    for old in old_process_ids {
        assert!(h.store.process(old).await.is_err());
    }
    let fresh = h.store.processes_of_run(run_b.id).await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].origin, "restart");

    // The restarted run executes to completion again.
    h.drive().await.unwrap();
    assert_eq!(
        h.store.run(run_b.id).await.unwrap().status(),
        RunStatus::Completed
    );
}
