// src/model/run.rs

//! Run records and their derived status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ArtifactId, NodeId, RunId, TaskDefId, WorkflowRunId};

/// Derived lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    /// States in which the run accepts no further dispatch.
    pub fn blocks_dispatch(self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Failed | RunStatus::Completed
        )
    }
}

/// One execution of a task definition against a set of input artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub task_def_id: TaskDefId,
    /// Set when this run executes a workflow node.
    pub workflow_run_id: Option<WorkflowRunId>,
    pub workflow_node_id: Option<NodeId>,

    /// Store-assigned creation sequence.
    pub seq: u64,
    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,

    /// Aggregate count of execution failures recorded across child
    /// processes, including superseded ones.
    pub error_count: u32,

    pub input_artifacts: Vec<ArtifactId>,
    pub output_artifacts: Vec<ArtifactId>,
}

impl RunRecord {
    pub fn status(&self) -> RunStatus {
        if self.stopped_at.is_some() {
            RunStatus::Stopped
        } else if self.failed_at.is_some() {
            RunStatus::Failed
        } else if self.completed_at.is_some() {
            RunStatus::Completed
        } else if self.started_at.is_some() {
            RunStatus::Running
        } else {
            RunStatus::Pending
        }
    }

    /// Clear terminal stamps so a restarted run re-enters pending.
    pub fn clear_terminal_stamps(&mut self) {
        self.started_at = None;
        self.completed_at = None;
        self.failed_at = None;
        self.stopped_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> RunRecord {
        RunRecord {
            id: RunId::new(),
            task_def_id: TaskDefId::new(),
            workflow_run_id: None,
            workflow_node_id: None,
            seq: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            stopped_at: None,
            error_count: 0,
            input_artifacts: Vec::new(),
            output_artifacts: Vec::new(),
        }
    }

    #[test]
    fn status_precedence() {
        let mut r = blank();
        assert_eq!(r.status(), RunStatus::Pending);

        r.started_at = Some(Utc::now());
        assert_eq!(r.status(), RunStatus::Running);

        r.completed_at = Some(Utc::now());
        assert_eq!(r.status(), RunStatus::Completed);

        r.stopped_at = Some(Utc::now());
        assert_eq!(r.status(), RunStatus::Stopped);
    }

    #[test]
    fn restart_returns_to_pending() {
        let mut r = blank();
        r.started_at = Some(Utc::now());
        r.failed_at = Some(Utc::now());
        r.clear_terminal_stamps();
        assert_eq!(r.status(), RunStatus::Pending);
    }
}
