// src/model/workflow.rs

//! Workflow runs: a directed graph of task-definition nodes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskloomError};
use crate::types::{NodeId, TaskDefId, WorkflowRunId};

/// An execution of a node graph, coordinating one run per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub name: String,
    /// Workflow-level concurrency cap across all member runs.
    pub max_workers: usize,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A node in a workflow run's graph, bound to one task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub workflow_run_id: WorkflowRunId,
    pub task_def_id: TaskDefId,
    pub name: String,
}

/// A directed dependency edge: the target node may only start once the
/// source node's run has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: NodeId,
    pub to: NodeId,
}

/// Adjacency view over a workflow run's nodes and edges.
///
/// Built on demand from store rows; cheap enough that callers construct one
/// per continuation decision instead of caching it.
#[derive(Debug)]
pub struct WorkflowGraph {
    nodes: HashMap<NodeId, WorkflowNode>,
    incoming: HashMap<NodeId, Vec<NodeId>>,
    outgoing: HashMap<NodeId, Vec<NodeId>>,
}

impl WorkflowGraph {
    /// Build and validate the graph: every edge endpoint must be a known
    /// node, the graph must be acyclic, and at least one starting node
    /// (no incoming edges) must exist.
    pub fn build(nodes: Vec<WorkflowNode>, edges: &[WorkflowEdge]) -> Result<Self> {
        if nodes.is_empty() {
            return Err(TaskloomError::Validation(
                "workflow has no nodes".to_string(),
            ));
        }

        let mut by_id = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in nodes {
            incoming.entry(node.id).or_default();
            outgoing.entry(node.id).or_default();
            by_id.insert(node.id, node);
        }

        let mut graph: DiGraphMap<NodeId, ()> = DiGraphMap::new();
        for id in by_id.keys() {
            graph.add_node(*id);
        }
        for edge in edges {
            for endpoint in [edge.from, edge.to] {
                if !by_id.contains_key(&endpoint) {
                    return Err(TaskloomError::Validation(format!(
                        "workflow edge references unknown node {endpoint}"
                    )));
                }
            }
            graph.add_edge(edge.from, edge.to, ());
            outgoing.entry(edge.from).or_default().push(edge.to);
            incoming.entry(edge.to).or_default().push(edge.from);
        }

        let built = Self {
            nodes: by_id,
            incoming,
            outgoing,
        };
        if built.roots().next().is_none() {
            return Err(TaskloomError::Validation(
                "workflow has no starting node".to_string(),
            ));
        }

        // A topological sort fails exactly when there is a cycle.
        if let Err(cycle) = toposort(&graph, None) {
            return Err(TaskloomError::Validation(format!(
                "cycle detected in workflow graph involving node {}",
                cycle.node_id()
            )));
        }
        Ok(built)
    }

    pub fn node(&self, id: NodeId) -> Option<&WorkflowNode> {
        self.nodes.get(&id)
    }

    /// Nodes with no incoming edges; the entry points of the workflow.
    pub fn roots(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes
            .values()
            .filter(|node| self.incoming_of(node.id).is_empty())
    }

    /// Direct predecessors of `id`.
    pub fn incoming_of(&self, id: NodeId) -> &[NodeId] {
        self.incoming.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct successors of `id`.
    pub fn outgoing_of(&self, id: NodeId) -> &[NodeId] {
        self.outgoing.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}
