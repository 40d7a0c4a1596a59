// src/types.rs

//! Identity newtypes and the explicit invoking-worker context.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// One independently dispatchable unit of execution within a run.
    ProcessId
);
uuid_id!(
    /// One execution of a task definition against a set of input artifacts.
    RunId
);
uuid_id!(
    /// An execution of a directed graph of task-definition nodes.
    WorkflowRunId
);
uuid_id!(
    /// A node inside a workflow run's graph.
    NodeId
);
uuid_id!(
    /// A unit-of-work type. External and read-only to this engine.
    TaskDefId
);
uuid_id!(
    /// An immutable-once-produced unit of input/output data.
    ArtifactId
);

/// Logical worker a process is partitioned for (from the task definition's
/// assigned workers), distinct from the job that happens to execute it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the job-queue consumer invoking an engine operation.
///
/// Passed explicitly into `prepare_process`/`run_process` for audit; the
/// engine never reads it from ambient process-wide state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerContext {
    pub job_id: Option<String>,
}

impl WorkerContext {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
        }
    }
}
