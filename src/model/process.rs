// src/model/process.rs

//! Process records and their derived status.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ArtifactId, ProcessId, RunId, WorkerId};

/// Derived lifecycle state of a process. Computed from the timestamp fields
/// on every read; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    /// Retryable failure; eligible for the restart machinery.
    Incomplete,
    Stopped,
    TimedOut,
}

impl ProcessStatus {
    /// Terminal states: nothing in the engine will move the process again
    /// (a timed-out process with retries left is replaced, not moved).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed
                | ProcessStatus::Failed
                | ProcessStatus::Stopped
                | ProcessStatus::TimedOut
        )
    }

    /// States counting against run- and workflow-level worker slots.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessStatus::Dispatched | ProcessStatus::Running)
    }
}

/// One independently dispatchable unit of execution within a run.
///
/// Status flags are nullable timestamps; [`ProcessRecord::status`] derives
/// the single current state from them. A restart never mutates this record
/// back to life: it mints a replacement, marks this one `superseded`, and
/// points `replaced_by` at the active successor (one hop, even after many
/// restarts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub run_id: RunId,
    /// Store-assigned creation sequence; the FIFO dispatch key.
    pub seq: u64,
    pub created_at: DateTime<Utc>,

    pub assigned_worker: Option<WorkerId>,
    /// Which operation created this record ("start", "restart", ...).
    pub origin: String,
    /// Job that last invoked execution, for audit.
    pub invoked_by: Option<String>,

    pub input_artifacts: Vec<ArtifactId>,
    /// Output-schema binding carried forward across restarts.
    pub output_binding: Option<String>,

    pub is_ready: bool,
    pub restart_count: u32,
    pub error_count: u32,

    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub incomplete_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,

    /// Tombstone marker for superseded (restarted) records.
    pub superseded: bool,
    /// Forward pointer to the active replacement, set on every record in a
    /// restart chain so history lookups resolve in one hop.
    pub replaced_by: Option<ProcessId>,
}

impl ProcessRecord {
    pub fn status(&self) -> ProcessStatus {
        derive_status(
            self.dispatched_at,
            self.started_at,
            self.completed_at,
            self.failed_at,
            self.incomplete_at,
            self.stopped_at,
            self.timeout_at,
        )
    }

    /// Whether a running process has exceeded its execution deadline.
    pub fn past_deadline(&self, timeout_after_seconds: i64, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => now >= started + Duration::seconds(timeout_after_seconds),
            None => false,
        }
    }

    /// Clear failure stamps on successful completion so `completed_at` is
    /// the only set terminal timestamp.
    pub fn clear_failure_stamps(&mut self) {
        self.failed_at = None;
        self.incomplete_at = None;
        self.stopped_at = None;
        self.timeout_at = None;
    }

    /// Clear every lifecycle stamp, forcing genuine re-execution on resume.
    pub fn clear_all_stamps(&mut self) {
        self.dispatched_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.clear_failure_stamps();
    }
}

/// Pure derivation of a process status from its timestamp fields.
///
/// Precedence: success first, then terminal failures (newest-wins ordering
/// is irrelevant because `complete` clears failure stamps), then the
/// in-flight states.
#[allow(clippy::too_many_arguments)]
pub fn derive_status(
    dispatched_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    incomplete_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
) -> ProcessStatus {
    if completed_at.is_some() {
        ProcessStatus::Completed
    } else if failed_at.is_some() {
        ProcessStatus::Failed
    } else if timeout_at.is_some() {
        ProcessStatus::TimedOut
    } else if stopped_at.is_some() {
        ProcessStatus::Stopped
    } else if incomplete_at.is_some() {
        ProcessStatus::Incomplete
    } else if started_at.is_some() {
        ProcessStatus::Running
    } else if dispatched_at.is_some() {
        ProcessStatus::Dispatched
    } else {
        ProcessStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> ProcessRecord {
        ProcessRecord {
            id: ProcessId::new(),
            run_id: RunId::new(),
            seq: 0,
            created_at: Utc::now(),
            assigned_worker: None,
            origin: "test".to_string(),
            invoked_by: None,
            input_artifacts: Vec::new(),
            output_binding: None,
            is_ready: false,
            restart_count: 0,
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
        }
    }

    #[test]
    fn blank_record_is_pending() {
        assert_eq!(blank().status(), ProcessStatus::Pending);
    }

    #[test]
    fn completed_wins_over_everything() {
        let mut p = blank();
        p.dispatched_at = Some(Utc::now());
        p.started_at = Some(Utc::now());
        p.completed_at = Some(Utc::now());
        assert_eq!(p.status(), ProcessStatus::Completed);
    }

    #[test]
    fn stopped_wins_over_incomplete() {
        let mut p = blank();
        p.started_at = Some(Utc::now());
        p.incomplete_at = Some(Utc::now());
        p.stopped_at = Some(Utc::now());
        assert_eq!(p.status(), ProcessStatus::Stopped);
    }

    #[test]
    fn started_without_terminal_stamp_is_running() {
        let mut p = blank();
        p.dispatched_at = Some(Utc::now());
        p.started_at = Some(Utc::now());
        assert_eq!(p.status(), ProcessStatus::Running);
        assert!(p.status().is_active());
    }

    #[test]
    fn past_deadline_requires_started() {
        let mut p = blank();
        let now = Utc::now();
        assert!(!p.past_deadline(0, now));

        p.started_at = Some(now - Duration::seconds(10));
        assert!(p.past_deadline(5, now));
        assert!(!p.past_deadline(60, now));
    }

    #[test]
    fn clear_all_stamps_returns_to_pending() {
        let mut p = blank();
        p.dispatched_at = Some(Utc::now());
        p.started_at = Some(Utc::now());
        p.timeout_at = Some(Utc::now());
        p.clear_all_stamps();
        assert_eq!(p.status(), ProcessStatus::Pending);
    }
}
