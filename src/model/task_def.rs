// src/model/task_def.rs

//! Task definitions: the unit-of-work types runs are created for.

use serde::{Deserialize, Serialize};

use crate::types::{TaskDefId, WorkerId};

/// A unit-of-work type. Owned by the embedding application and immutable for
/// the duration of a run; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskDefId,
    pub name: String,
    /// Registry key resolving to the [`crate::runner::Runner`] implementation
    /// for this work type.
    pub runner: String,
    /// Run-level concurrency cap.
    pub max_workers: usize,
    /// How many automatic restarts a process gets after timeouts or
    /// retryable failures.
    pub max_process_retries: u32,
    /// Seconds after `started_at` before a running process is considered
    /// timed out. `None` disables the timeout sweep for this work type.
    pub timeout_after_seconds: Option<i64>,
    /// Logical workers partitioning fans work out over. Empty means a single
    /// unassigned process per artifact group.
    pub assigned_workers: Vec<WorkerId>,
}
