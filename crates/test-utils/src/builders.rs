#![allow(dead_code)]

use taskloom::{NodeSeed, TaskDefId, TaskDefinition, WorkerId, WorkflowSeed};

/// Builder for `TaskDefinition` to simplify test setup.
pub struct TaskDefBuilder {
    def: TaskDefinition,
}

impl TaskDefBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            def: TaskDefinition {
                id: TaskDefId::new(),
                name: name.to_string(),
                runner: "fake".to_string(),
                max_workers: 1,
                max_process_retries: 0,
                timeout_after_seconds: None,
                assigned_workers: Vec::new(),
            },
        }
    }

    pub fn runner(mut self, key: &str) -> Self {
        self.def.runner = key.to_string();
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.def.max_workers = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.def.max_process_retries = n;
        self
    }

    pub fn timeout_after(mut self, seconds: i64) -> Self {
        self.def.timeout_after_seconds = Some(seconds);
        self
    }

    pub fn worker(mut self, id: &str) -> Self {
        self.def.assigned_workers.push(WorkerId(id.to_string()));
        self
    }

    pub fn build(self) -> TaskDefinition {
        self.def
    }
}

/// Builder for `WorkflowSeed`: add nodes, then connect them by index.
pub struct WorkflowSeedBuilder {
    seed: WorkflowSeed,
}

impl WorkflowSeedBuilder {
    pub fn new(name: &str, max_workers: usize) -> Self {
        Self {
            seed: WorkflowSeed {
                name: name.to_string(),
                max_workers,
                nodes: Vec::new(),
                edges: Vec::new(),
            },
        }
    }

    /// Add a node bound to `def`; returns its index for `edge`.
    pub fn node(&mut self, name: &str, def: &TaskDefinition) -> usize {
        self.seed.nodes.push(NodeSeed {
            task_def_id: def.id,
            name: name.to_string(),
        });
        self.seed.nodes.len() - 1
    }

    pub fn edge(&mut self, from: usize, to: usize) -> &mut Self {
        self.seed.edges.push((from, to));
        self
    }

    pub fn build(self) -> WorkflowSeed {
        self.seed
    }
}
