// src/store/mod.rs

//! Persistence contract for the engine.
//!
//! Implementations are responsible for making record transitions explicit:
//!
//! - every `save_*` replaces the row atomically; readers never observe a
//!   half-written record,
//! - ordered queries (`processes_of_run`, `processes_of_workflow`) return
//!   rows in creation order, which is the engine's only dispatch fairness
//!   key,
//! - tombstoned (superseded) processes are excluded from live queries but
//!   remain fetchable by id for history lookups.
//!
//! The engine serializes conflicting writers through
//! [`crate::lock::MutexService`]; the store only has to provide row-level
//! atomicity, not cross-entity transactions.

pub mod memory;

use async_trait::async_trait;

use crate::errors::Result;
use crate::model::{
    ArtifactRecord, ProcessRecord, RunRecord, TaskDefinition, WorkflowEdge, WorkflowNode,
    WorkflowRun,
};
use crate::types::{ArtifactId, NodeId, ProcessId, RunId, TaskDefId, WorkerId, WorkflowRunId};

pub use memory::MemoryStore;

/// Fields the caller chooses when creating a run; identity, sequence, and
/// timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct RunSeed {
    pub task_def_id: TaskDefId,
    pub workflow_run_id: Option<WorkflowRunId>,
    pub workflow_node_id: Option<NodeId>,
    pub input_artifacts: Vec<ArtifactId>,
}

/// Fields the caller chooses when creating a process.
#[derive(Debug, Clone)]
pub struct ProcessSeed {
    pub run_id: RunId,
    pub assigned_worker: Option<WorkerId>,
    /// Which operation created the process ("start", "restart", ...).
    pub origin: String,
    pub input_artifacts: Vec<ArtifactId>,
    pub output_binding: Option<String>,
    pub restart_count: u32,
}

/// A node to create inside a new workflow run.
#[derive(Debug, Clone)]
pub struct NodeSeed {
    pub task_def_id: TaskDefId,
    pub name: String,
}

/// A new workflow run: nodes plus edges referencing them by index.
#[derive(Debug, Clone)]
pub struct WorkflowSeed {
    pub name: String,
    pub max_workers: usize,
    pub nodes: Vec<NodeSeed>,
    /// `(from, to)` pairs indexing into `nodes`.
    pub edges: Vec<(usize, usize)>,
}

/// Fields the caller chooses when creating an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactSeed {
    pub task_def_id: Option<TaskDefId>,
    pub parent_id: Option<ArtifactId>,
}

#[async_trait]
pub trait ProcessStore: Send + Sync {
    // Task definitions (read-mostly; registered at startup).
    async fn insert_task_definition(&self, def: TaskDefinition) -> Result<()>;
    async fn task_definition(&self, id: TaskDefId) -> Result<TaskDefinition>;

    // Runs.
    async fn insert_run(&self, seed: RunSeed) -> Result<RunRecord>;
    async fn run(&self, id: RunId) -> Result<RunRecord>;
    async fn save_run(&self, run: RunRecord) -> Result<()>;
    async fn runs_of_workflow(&self, id: WorkflowRunId) -> Result<Vec<RunRecord>>;
    /// The run bound to a workflow node, if one was started.
    async fn run_for_node(&self, node: NodeId) -> Result<Option<RunRecord>>;
    /// Cascading delete of a run's processes (live and superseded).
    async fn delete_processes_of_run(&self, run: RunId) -> Result<()>;

    // Processes.
    async fn insert_process(&self, seed: ProcessSeed) -> Result<ProcessRecord>;
    async fn process(&self, id: ProcessId) -> Result<ProcessRecord>;
    async fn save_process(&self, process: ProcessRecord) -> Result<()>;
    /// Live (non-superseded) processes of a run, in creation order.
    async fn processes_of_run(&self, run: RunId) -> Result<Vec<ProcessRecord>>;
    /// Live processes across every run of a workflow, in creation order.
    async fn processes_of_workflow(&self, wf: WorkflowRunId) -> Result<Vec<ProcessRecord>>;
    /// Live processes currently counting against the run's slots.
    async fn count_active_for_run(&self, run: RunId) -> Result<usize>;
    /// Live processes currently counting against the workflow's slots.
    async fn count_active_for_workflow(&self, wf: WorkflowRunId) -> Result<usize>;
    /// Superseded records whose forward pointer references `active`.
    async fn chain_predecessors(&self, active: ProcessId) -> Result<Vec<ProcessRecord>>;

    // Workflow runs.
    async fn insert_workflow_run(
        &self,
        seed: WorkflowSeed,
    ) -> Result<(WorkflowRun, Vec<WorkflowNode>)>;
    async fn workflow_run(&self, id: WorkflowRunId) -> Result<WorkflowRun>;
    async fn save_workflow_run(&self, wf: WorkflowRun) -> Result<()>;
    async fn workflow_nodes(&self, id: WorkflowRunId) -> Result<Vec<WorkflowNode>>;
    async fn workflow_edges(&self, id: WorkflowRunId) -> Result<Vec<WorkflowEdge>>;

    // Artifacts.
    async fn insert_artifact(&self, seed: ArtifactSeed) -> Result<ArtifactRecord>;
    async fn artifact(&self, id: ArtifactId) -> Result<ArtifactRecord>;
    /// Copy `id` and its whole child tree under a new owner; returns the id
    /// of the copied root.
    async fn deep_copy_artifact(&self, id: ArtifactId, owner: TaskDefId) -> Result<ArtifactId>;
}
