// src/store/memory.rs

//! In-memory store, the reference [`ProcessStore`] implementation.
//!
//! Every operation takes the single state mutex, so each save replaces its
//! row atomically. A monotonic sequence counter stamps creation order;
//! queries sort by it rather than by wall-clock time so FIFO stays
//! deterministic even when records are created within the same instant.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::{Result, TaskloomError};
use crate::model::{
    ArtifactRecord, ProcessRecord, RunRecord, TaskDefinition, WorkflowEdge, WorkflowNode,
    WorkflowRun,
};
use crate::types::{ArtifactId, NodeId, ProcessId, RunId, TaskDefId, WorkflowRunId};

use super::{ArtifactSeed, ProcessSeed, ProcessStore, RunSeed, WorkflowSeed};

#[derive(Default)]
struct State {
    next_seq: u64,
    task_defs: HashMap<TaskDefId, TaskDefinition>,
    runs: HashMap<RunId, RunRecord>,
    processes: HashMap<ProcessId, ProcessRecord>,
    workflows: HashMap<WorkflowRunId, WorkflowRun>,
    nodes: HashMap<NodeId, WorkflowNode>,
    edges: HashMap<WorkflowRunId, Vec<WorkflowEdge>>,
    artifacts: HashMap<ArtifactId, ArtifactRecord>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn workflow_of_run(&self, run: RunId) -> Option<WorkflowRunId> {
        self.runs.get(&run).and_then(|r| r.workflow_run_id)
    }
}

/// In-memory [`ProcessStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &'static str, id: impl std::fmt::Display) -> TaskloomError {
    TaskloomError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn insert_task_definition(&self, def: TaskDefinition) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        state.task_defs.insert(def.id, def);
        Ok(())
    }

    async fn task_definition(&self, id: TaskDefId) -> Result<TaskDefinition> {
        let state = self.state.lock().expect("store state poisoned");
        state
            .task_defs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("task definition", id))
    }

    async fn insert_run(&self, seed: RunSeed) -> Result<RunRecord> {
        let mut state = self.state.lock().expect("store state poisoned");
        let seq = state.next_seq();
        let run = RunRecord {
            id: RunId::new(),
            task_def_id: seed.task_def_id,
            workflow_run_id: seed.workflow_run_id,
            workflow_node_id: seed.workflow_node_id,
            seq,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            stopped_at: None,
            error_count: 0,
            input_artifacts: seed.input_artifacts,
            output_artifacts: Vec::new(),
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn run(&self, id: RunId) -> Result<RunRecord> {
        let state = self.state.lock().expect("store state poisoned");
        state
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("run", id))
    }

    async fn save_run(&self, run: RunRecord) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        if !state.runs.contains_key(&run.id) {
            return Err(not_found("run", run.id));
        }
        state.runs.insert(run.id, run);
        Ok(())
    }

    async fn runs_of_workflow(&self, id: WorkflowRunId) -> Result<Vec<RunRecord>> {
        let state = self.state.lock().expect("store state poisoned");
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|run| run.workflow_run_id == Some(id))
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.seq);
        Ok(runs)
    }

    async fn run_for_node(&self, node: NodeId) -> Result<Option<RunRecord>> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state
            .runs
            .values()
            .filter(|run| run.workflow_node_id == Some(node))
            .max_by_key(|run| run.seq)
            .cloned())
    }

    async fn delete_processes_of_run(&self, run: RunId) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        state.processes.retain(|_, process| process.run_id != run);
        Ok(())
    }

    async fn insert_process(&self, seed: ProcessSeed) -> Result<ProcessRecord> {
        let mut state = self.state.lock().expect("store state poisoned");
        if !state.runs.contains_key(&seed.run_id) {
            return Err(not_found("run", seed.run_id));
        }
        let seq = state.next_seq();
        let process = ProcessRecord {
            id: ProcessId::new(),
            run_id: seed.run_id,
            seq,
            created_at: Utc::now(),
            assigned_worker: seed.assigned_worker,
            origin: seed.origin,
            invoked_by: None,
            input_artifacts: seed.input_artifacts,
            output_binding: seed.output_binding,
            is_ready: false,
            restart_count: seed.restart_count,
            error_count: 0,
            dispatched_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            incomplete_at: None,
            stopped_at: None,
            timeout_at: None,
            superseded: false,
            replaced_by: None,
        };
        state.processes.insert(process.id, process.clone());
        Ok(process)
    }

    async fn process(&self, id: ProcessId) -> Result<ProcessRecord> {
        let state = self.state.lock().expect("store state poisoned");
        state
            .processes
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("process", id))
    }

    async fn save_process(&self, process: ProcessRecord) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        if !state.processes.contains_key(&process.id) {
            return Err(not_found("process", process.id));
        }
        state.processes.insert(process.id, process);
        Ok(())
    }

    async fn processes_of_run(&self, run: RunId) -> Result<Vec<ProcessRecord>> {
        let state = self.state.lock().expect("store state poisoned");
        let mut processes: Vec<_> = state
            .processes
            .values()
            .filter(|process| process.run_id == run && !process.superseded)
            .cloned()
            .collect();
        processes.sort_by_key(|process| process.seq);
        Ok(processes)
    }

    async fn processes_of_workflow(&self, wf: WorkflowRunId) -> Result<Vec<ProcessRecord>> {
        let state = self.state.lock().expect("store state poisoned");
        let mut processes: Vec<_> = state
            .processes
            .values()
            .filter(|process| {
                !process.superseded && state.workflow_of_run(process.run_id) == Some(wf)
            })
            .cloned()
            .collect();
        processes.sort_by_key(|process| process.seq);
        Ok(processes)
    }

    async fn count_active_for_run(&self, run: RunId) -> Result<usize> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state
            .processes
            .values()
            .filter(|process| {
                process.run_id == run && !process.superseded && process.status().is_active()
            })
            .count())
    }

    async fn count_active_for_workflow(&self, wf: WorkflowRunId) -> Result<usize> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state
            .processes
            .values()
            .filter(|process| {
                !process.superseded
                    && process.status().is_active()
                    && state.workflow_of_run(process.run_id) == Some(wf)
            })
            .count())
    }

    async fn chain_predecessors(&self, active: ProcessId) -> Result<Vec<ProcessRecord>> {
        let state = self.state.lock().expect("store state poisoned");
        let mut predecessors: Vec<_> = state
            .processes
            .values()
            .filter(|process| process.superseded && process.replaced_by == Some(active))
            .cloned()
            .collect();
        predecessors.sort_by_key(|process| process.seq);
        Ok(predecessors)
    }

    async fn insert_workflow_run(
        &self,
        seed: WorkflowSeed,
    ) -> Result<(WorkflowRun, Vec<WorkflowNode>)> {
        let mut state = self.state.lock().expect("store state poisoned");
        let seq = state.next_seq();
        let workflow = WorkflowRun {
            id: WorkflowRunId::new(),
            name: seed.name,
            max_workers: seed.max_workers,
            seq,
            created_at: Utc::now(),
            completed_at: None,
        };

        let nodes: Vec<WorkflowNode> = seed
            .nodes
            .into_iter()
            .map(|node| WorkflowNode {
                id: NodeId::new(),
                workflow_run_id: workflow.id,
                task_def_id: node.task_def_id,
                name: node.name,
            })
            .collect();

        let mut edges = Vec::with_capacity(seed.edges.len());
        for (from, to) in seed.edges {
            let (Some(from), Some(to)) = (nodes.get(from), nodes.get(to)) else {
                return Err(TaskloomError::Validation(format!(
                    "workflow edge ({from}, {to}) references a node index out of range"
                )));
            };
            edges.push(WorkflowEdge {
                from: from.id,
                to: to.id,
            });
        }

        state.workflows.insert(workflow.id, workflow.clone());
        for node in &nodes {
            state.nodes.insert(node.id, node.clone());
        }
        state.edges.insert(workflow.id, edges);
        Ok((workflow, nodes))
    }

    async fn workflow_run(&self, id: WorkflowRunId) -> Result<WorkflowRun> {
        let state = self.state.lock().expect("store state poisoned");
        state
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("workflow run", id))
    }

    async fn save_workflow_run(&self, wf: WorkflowRun) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        if !state.workflows.contains_key(&wf.id) {
            return Err(not_found("workflow run", wf.id));
        }
        state.workflows.insert(wf.id, wf);
        Ok(())
    }

    async fn workflow_nodes(&self, id: WorkflowRunId) -> Result<Vec<WorkflowNode>> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state
            .nodes
            .values()
            .filter(|node| node.workflow_run_id == id)
            .cloned()
            .collect())
    }

    async fn workflow_edges(&self, id: WorkflowRunId) -> Result<Vec<WorkflowEdge>> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state.edges.get(&id).cloned().unwrap_or_default())
    }

    async fn insert_artifact(&self, seed: ArtifactSeed) -> Result<ArtifactRecord> {
        let mut state = self.state.lock().expect("store state poisoned");
        let seq = state.next_seq();
        let artifact = ArtifactRecord {
            id: ArtifactId::new(),
            task_def_id: seed.task_def_id,
            parent_id: seed.parent_id,
            seq,
            created_at: Utc::now(),
        };
        state.artifacts.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn artifact(&self, id: ArtifactId) -> Result<ArtifactRecord> {
        let state = self.state.lock().expect("store state poisoned");
        state
            .artifacts
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("artifact", id))
    }

    async fn deep_copy_artifact(&self, id: ArtifactId, owner: TaskDefId) -> Result<ArtifactId> {
        let mut state = self.state.lock().expect("store state poisoned");
        if !state.artifacts.contains_key(&id) {
            return Err(not_found("artifact", id));
        }

        // Copy breadth-first, remembering old -> new ids so children attach
        // to their copied parents.
        let mut mapping: HashMap<ArtifactId, ArtifactId> = HashMap::new();
        let mut queue = vec![id];
        while let Some(old_id) = queue.pop() {
            let original = state.artifacts[&old_id].clone();
            let seq = state.next_seq();
            let copy = ArtifactRecord {
                id: ArtifactId::new(),
                task_def_id: Some(owner),
                parent_id: original
                    .parent_id
                    .and_then(|parent| mapping.get(&parent).copied()),
                seq,
                created_at: Utc::now(),
            };
            mapping.insert(old_id, copy.id);
            state.artifacts.insert(copy.id, copy);

            let children: Vec<ArtifactId> = state
                .artifacts
                .values()
                .filter(|candidate| candidate.parent_id == Some(old_id))
                .map(|candidate| candidate.id)
                .collect();
            queue.extend(children);
        }

        Ok(mapping[&id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessStatus;

    fn task_def() -> TaskDefinition {
        TaskDefinition {
            id: TaskDefId::new(),
            name: "ingest".to_string(),
            runner: "noop".to_string(),
            max_workers: 2,
            max_process_retries: 1,
            timeout_after_seconds: None,
            assigned_workers: Vec::new(),
        }
    }

    fn run_seed(def: &TaskDefinition) -> RunSeed {
        RunSeed {
            task_def_id: def.id,
            workflow_run_id: None,
            workflow_node_id: None,
            input_artifacts: Vec::new(),
        }
    }

    fn process_seed(run: RunId) -> ProcessSeed {
        ProcessSeed {
            run_id: run,
            assigned_worker: None,
            origin: "start".to_string(),
            input_artifacts: Vec::new(),
            output_binding: None,
            restart_count: 0,
        }
    }

    #[tokio::test]
    async fn processes_of_run_are_creation_ordered_and_skip_tombstones() {
        let store = MemoryStore::new();
        let def = task_def();
        store.insert_task_definition(def.clone()).await.unwrap();
        let run = store.insert_run(run_seed(&def)).await.unwrap();

        let first = store.insert_process(process_seed(run.id)).await.unwrap();
        let second = store.insert_process(process_seed(run.id)).await.unwrap();
        let mut third = store.insert_process(process_seed(run.id)).await.unwrap();

        third.superseded = true;
        store.save_process(third).await.unwrap();

        let live = store.processes_of_run(run.id).await.unwrap();
        let ids: Vec<_> = live.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(live[0].seq < live[1].seq);
    }

    #[tokio::test]
    async fn count_active_counts_dispatched_and_running_only() {
        let store = MemoryStore::new();
        let def = task_def();
        store.insert_task_definition(def.clone()).await.unwrap();
        let run = store.insert_run(run_seed(&def)).await.unwrap();

        let mut dispatched = store.insert_process(process_seed(run.id)).await.unwrap();
        dispatched.dispatched_at = Some(Utc::now());
        store.save_process(dispatched).await.unwrap();

        let mut running = store.insert_process(process_seed(run.id)).await.unwrap();
        running.started_at = Some(Utc::now());
        store.save_process(running).await.unwrap();

        let mut done = store.insert_process(process_seed(run.id)).await.unwrap();
        done.completed_at = Some(Utc::now());
        store.save_process(done.clone()).await.unwrap();
        assert_eq!(done.status(), ProcessStatus::Completed);

        let _pending = store.insert_process(process_seed(run.id)).await.unwrap();

        assert_eq!(store.count_active_for_run(run.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deep_copy_clones_child_tree_under_new_owner() {
        let store = MemoryStore::new();
        let original_owner = TaskDefId::new();
        let new_owner = TaskDefId::new();

        let root = store
            .insert_artifact(ArtifactSeed {
                task_def_id: Some(original_owner),
                parent_id: None,
            })
            .await
            .unwrap();
        let child = store
            .insert_artifact(ArtifactSeed {
                task_def_id: Some(original_owner),
                parent_id: Some(root.id),
            })
            .await
            .unwrap();

        let copy_id = store.deep_copy_artifact(root.id, new_owner).await.unwrap();
        assert_ne!(copy_id, root.id);

        let copy = store.artifact(copy_id).await.unwrap();
        assert_eq!(copy.task_def_id, Some(new_owner));
        assert!(copy.parent_id.is_none());

        // The original tree is untouched.
        assert_eq!(
            store.artifact(child.id).await.unwrap().task_def_id,
            Some(original_owner)
        );

        // Exactly one copied child hangs off the copied root.
        let state = store.state.lock().unwrap();
        let copied_children: Vec<_> = state
            .artifacts
            .values()
            .filter(|a| a.parent_id == Some(copy_id))
            .collect();
        assert_eq!(copied_children.len(), 1);
        assert_eq!(copied_children[0].task_def_id, Some(new_owner));
    }

    #[tokio::test]
    async fn delete_processes_of_run_removes_tombstones_too() {
        let store = MemoryStore::new();
        let def = task_def();
        store.insert_task_definition(def.clone()).await.unwrap();
        let run = store.insert_run(run_seed(&def)).await.unwrap();

        let keep_run = store.insert_run(run_seed(&def)).await.unwrap();
        let kept = store.insert_process(process_seed(keep_run.id)).await.unwrap();

        let mut gone = store.insert_process(process_seed(run.id)).await.unwrap();
        gone.superseded = true;
        store.save_process(gone.clone()).await.unwrap();
        store.insert_process(process_seed(run.id)).await.unwrap();

        store.delete_processes_of_run(run.id).await.unwrap();

        assert!(store.process(gone.id).await.is_err());
        assert!(store.process(kept.id).await.is_ok());
    }
}
