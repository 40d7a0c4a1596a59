// src/engine/workflow.rs

//! Workflow continuation: starting runs for root nodes and, on each run
//! completion, for whichever downstream nodes became ready.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};

use crate::errors::{Result, TaskloomError};
use crate::model::{RunRecord, RunStatus, WorkflowEdge, WorkflowGraph, WorkflowNode, WorkflowRun};
use crate::store::WorkflowSeed;
use crate::types::{ArtifactId, NodeId, WorkerContext, WorkflowRunId};

use super::{Engine, workflow_key};

/// Shape-check a workflow seed before any rows are created: edge indices in
/// range, at least one starting node, no cycles.
fn validate_workflow_seed(seed: &WorkflowSeed) -> Result<()> {
    let placeholder = WorkflowRunId::new();
    let nodes: Vec<WorkflowNode> = seed
        .nodes
        .iter()
        .map(|node| WorkflowNode {
            id: NodeId::new(),
            workflow_run_id: placeholder,
            task_def_id: node.task_def_id,
            name: node.name.clone(),
        })
        .collect();

    let mut edges = Vec::with_capacity(seed.edges.len());
    for (from, to) in &seed.edges {
        let (Some(source), Some(target)) = (nodes.get(*from), nodes.get(*to)) else {
            return Err(TaskloomError::Validation(format!(
                "workflow edge ({from}, {to}) references a node index out of range"
            )));
        };
        edges.push(WorkflowEdge {
            from: source.id,
            to: target.id,
        });
    }

    WorkflowGraph::build(nodes, &edges).map(|_| ())
}

impl Engine {
    /// Create a workflow run and start one run per starting node, feeding
    /// each the workflow's initial input artifacts.
    pub async fn start_workflow(
        &self,
        seed: WorkflowSeed,
        inputs: Vec<ArtifactId>,
        ctx: &WorkerContext,
    ) -> Result<WorkflowRun> {
        validate_workflow_seed(&seed)?;

        let store = self.store();
        let (workflow, nodes) = store.insert_workflow_run(seed).await?;
        let edges = store.workflow_edges(workflow.id).await?;
        let graph = WorkflowGraph::build(nodes, &edges)?;

        {
            let _guard = self.inner.locks.acquire(&workflow_key(workflow.id)).await?;
            // Name order keeps run creation (and so dispatch FIFO) stable.
            let mut roots: Vec<WorkflowNode> = graph.roots().cloned().collect();
            roots.sort_by(|a, b| a.name.cmp(&b.name));
            info!(
                workflow = %workflow.id,
                roots = roots.len(),
                "starting workflow"
            );
            for node in roots {
                self.prepare_run_inner(
                    node.task_def_id,
                    inputs.clone(),
                    Some(workflow.id),
                    Some(node.id),
                    "start",
                    ctx,
                )
                .await?;
            }
        }

        self.dispatch_for_workflow(workflow.id).await?;
        store.workflow_run(workflow.id).await
    }

    /// React to a member run completing: start runs for downstream nodes
    /// whose every predecessor has completed, and mark the workflow
    /// completed once no run remains pending or running.
    ///
    /// A node with multiple incoming edges starts exactly once, when the
    /// last predecessor finishes; its inputs are the union of all source
    /// outputs. Readiness evaluation and run creation share the workflow
    /// mutex, so two predecessors completing concurrently cannot both start
    /// the join node.
    pub(crate) async fn on_workflow_run_complete(&self, run: &RunRecord) -> Result<()> {
        let workflow_id = run.workflow_run_id.ok_or_else(|| {
            TaskloomError::Validation(format!("run {} is not part of a workflow", run.id))
        })?;
        let node_id = run.workflow_node_id.ok_or_else(|| {
            TaskloomError::Validation(format!(
                "workflow member run {} has no node binding",
                run.id
            ))
        })?;

        let _guard = self.inner.locks.acquire(&workflow_key(workflow_id)).await?;
        let store = self.store();
        let nodes = store.workflow_nodes(workflow_id).await?;
        let edges = store.workflow_edges(workflow_id).await?;
        let graph = WorkflowGraph::build(nodes, &edges)?;

        let mut started_any = false;
        for target in graph.outgoing_of(node_id).to_vec() {
            if store.run_for_node(target).await?.is_some() {
                debug!(node = %target, "downstream node already has a run");
                continue;
            }

            // Ready iff *every* incoming edge's source run is completed;
            // never triggered speculatively.
            let mut ready = true;
            let mut inputs: Vec<ArtifactId> = Vec::new();
            let mut seen: HashSet<ArtifactId> = HashSet::new();
            for source in graph.incoming_of(target) {
                match store.run_for_node(*source).await? {
                    Some(source_run) if source_run.status() == RunStatus::Completed => {
                        for artifact in source_run.output_artifacts {
                            if seen.insert(artifact) {
                                inputs.push(artifact);
                            }
                        }
                    }
                    _ => {
                        ready = false;
                        break;
                    }
                }
            }
            if !ready {
                debug!(node = %target, "join not ready; waiting for remaining predecessors");
                continue;
            }

            let node = graph.node(target).ok_or_else(|| {
                TaskloomError::Validation(format!("workflow node {target} disappeared"))
            })?;
            let new_run = self
                .prepare_run_inner(
                    node.task_def_id,
                    inputs,
                    Some(workflow_id),
                    Some(target),
                    "start",
                    &WorkerContext::default(),
                )
                .await?;
            info!(
                workflow = %workflow_id,
                node = %target,
                run = %new_run.id,
                "downstream run started"
            );
            started_any = true;
        }

        if !started_any {
            let runs = store.runs_of_workflow(workflow_id).await?;
            let settled = !runs.is_empty()
                && !runs
                    .iter()
                    .any(|r| matches!(r.status(), RunStatus::Pending | RunStatus::Running));
            if settled {
                let mut workflow = store.workflow_run(workflow_id).await?;
                if workflow.completed_at.is_none() {
                    workflow.completed_at = Some(Utc::now());
                    store.save_workflow_run(workflow).await?;
                    info!(workflow = %workflow_id, "workflow completed");
                }
            }
        }
        Ok(())
    }

    /// Union of output artifacts from completed upstream nodes, used when a
    /// workflow-bound run restarts and must re-derive its inputs.
    pub(crate) async fn collect_upstream_outputs(
        &self,
        workflow_id: WorkflowRunId,
        node_id: NodeId,
    ) -> Result<Vec<ArtifactId>> {
        let store = self.store();
        let edges = store.workflow_edges(workflow_id).await?;

        let mut inputs = Vec::new();
        let mut seen = HashSet::new();
        for edge in edges.iter().filter(|edge| edge.to == node_id) {
            let Some(source_run) = store.run_for_node(edge.from).await? else {
                continue;
            };
            if source_run.status() != RunStatus::Completed {
                continue;
            }
            for artifact in source_run.output_artifacts {
                if seen.insert(artifact) {
                    inputs.push(artifact);
                }
            }
        }
        Ok(inputs)
    }
}
