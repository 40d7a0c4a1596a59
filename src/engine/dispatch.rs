// src/engine/dispatch.rs

//! Slot-aware dispatch: decide which pending processes launch next.
//!
//! Two entry points with identical semantics at different scopes. Creation
//! order is the sole ordering key (oldest eligible first is the one
//! fairness invariant), and each pass works on a single atomic snapshot of
//! slot counts taken at its start. The dispatcher never interprets
//! execution failures; it only marks rows and hands ids to the sink after
//! every mutex is released.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::errors::{Result, TaskloomError};
use crate::model::{ProcessRecord, ProcessStatus, RunRecord};
use crate::types::{ProcessId, RunId, WorkflowRunId};

use super::{Engine, run_key, workflow_key};

/// Per-pass snapshot of one run's dispatch budget inside a workflow pass.
struct RunSlots {
    run: RunRecord,
    timeout_after_seconds: Option<i64>,
    remaining: usize,
}

fn is_overdue(
    process: &ProcessRecord,
    timeout_after_seconds: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    timeout_after_seconds.is_some_and(|limit| process.past_deadline(limit, now))
}

impl Engine {
    /// Launch eligible processes of a standalone run, oldest first, within
    /// the task definition's `max_workers`. Runs belonging to a workflow
    /// delegate to [`Engine::dispatch_for_workflow`] so prioritization
    /// happens once, at the outermost scope.
    pub async fn dispatch_for_run(&self, id: RunId) -> Result<()> {
        let run = self.store().run(id).await?;
        if let Some(workflow) = run.workflow_run_id {
            return self.dispatch_for_workflow(workflow).await;
        }

        let batch = {
            let _guard = self.inner.locks.acquire(&run_key(id)).await?;
            let store = self.store();
            let mut run = store.run(id).await?;
            if run.status().blocks_dispatch() {
                debug!(run = %id, status = ?run.status(), "run blocks dispatch");
                return Ok(());
            }

            let def = store.task_definition(run.task_def_id).await?;
            let mut available = def
                .max_workers
                .saturating_sub(store.count_active_for_run(id).await?);
            if available == 0 {
                debug!(run = %id, "no free run slots");
                return Ok(());
            }

            let now = Utc::now();
            let mut batch = Vec::new();
            for process in store.processes_of_run(id).await? {
                if available == 0 {
                    break;
                }
                match process.status() {
                    ProcessStatus::Pending if process.is_ready => {
                        let mut process = process;
                        process.dispatched_at = Some(now);
                        store.save_process(process.clone()).await?;
                        debug!(process = %process.id, run = %id, "process dispatched");
                        batch.push(process.id);
                        available -= 1;
                    }
                    ProcessStatus::Running
                        if is_overdue(&process, def.timeout_after_seconds, now) =>
                    {
                        self.timeout_and_maybe_restart(process.id).await?;
                    }
                    _ => {}
                }
            }

            if !batch.is_empty() && run.started_at.is_none() {
                run.started_at = Some(now);
                store.save_run(run).await?;
            }
            batch
        };

        self.push_to_sink(batch).await
    }

    /// Launch eligible processes across every run of a workflow, in global
    /// creation order (cross-run FIFO), within both the workflow's and each
    /// run's `max_workers`.
    ///
    /// Run-level remaining slots are cached per pass: a process skipped
    /// because its run is full is not reconsidered mid-pass even if a
    /// sibling completes meanwhile.
    pub async fn dispatch_for_workflow(&self, id: WorkflowRunId) -> Result<()> {
        let batch = {
            let _guard = self.inner.locks.acquire(&workflow_key(id)).await?;
            let store = self.store();
            let workflow = store.workflow_run(id).await?;
            if workflow.completed_at.is_some() {
                debug!(workflow = %id, "workflow already completed");
                return Ok(());
            }

            let mut available = workflow
                .max_workers
                .saturating_sub(store.count_active_for_workflow(id).await?);
            if available == 0 {
                debug!(workflow = %id, "no free workflow slots");
                return Ok(());
            }

            let now = Utc::now();
            let mut slots: HashMap<RunId, RunSlots> = HashMap::new();
            let mut batch = Vec::new();

            for process in store.processes_of_workflow(id).await? {
                if available == 0 {
                    break;
                }

                if !slots.contains_key(&process.run_id) {
                    let run = store.run(process.run_id).await?;
                    let def = store.task_definition(run.task_def_id).await?;
                    let remaining = def
                        .max_workers
                        .saturating_sub(store.count_active_for_run(run.id).await?);
                    slots.insert(
                        process.run_id,
                        RunSlots {
                            run,
                            timeout_after_seconds: def.timeout_after_seconds,
                            remaining,
                        },
                    );
                }

                match process.status() {
                    ProcessStatus::Pending if process.is_ready => {
                        let run_id = process.run_id;
                        {
                            let entry = &slots[&run_id];
                            if entry.run.status().blocks_dispatch() || entry.remaining == 0 {
                                continue;
                            }
                        }

                        let mut process = process;
                        process.dispatched_at = Some(now);
                        store.save_process(process.clone()).await?;
                        debug!(
                            process = %process.id,
                            run = %run_id,
                            workflow = %id,
                            "process dispatched"
                        );
                        batch.push(process.id);
                        available -= 1;

                        let entry = slots.get_mut(&run_id).expect("slot entry just inserted");
                        entry.remaining -= 1;
                        if entry.run.started_at.is_none() {
                            entry.run.started_at = Some(now);
                            let run = entry.run.clone();
                            store.save_run(run).await?;
                        }
                    }
                    ProcessStatus::Running => {
                        let overdue = slots
                            .get(&process.run_id)
                            .is_some_and(|entry| {
                                is_overdue(&process, entry.timeout_after_seconds, now)
                            });
                        if overdue {
                            self.timeout_and_maybe_restart(process.id).await?;
                        }
                    }
                    _ => {}
                }
            }
            batch
        };

        self.push_to_sink(batch).await
    }

    /// Time out an overdue process and restart it while retries remain.
    ///
    /// Conflicts are skipped, not raised: between the snapshot and the
    /// process-mutex acquisition another worker may already have stopped or
    /// replaced the record.
    pub(crate) async fn timeout_and_maybe_restart(&self, id: ProcessId) -> Result<()> {
        let eligible = match self.mark_process_timed_out(id).await {
            Ok(eligible) => eligible,
            Err(TaskloomError::Conflict(reason)) => {
                debug!(process = %id, reason, "timeout marking skipped");
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        if eligible {
            match self.restart_process_inner(id).await {
                Ok(replacement) => {
                    info!(
                        process = %id,
                        replacement = %replacement.id,
                        "timed-out process queued for retry"
                    );
                }
                Err(TaskloomError::Conflict(reason)) => {
                    debug!(process = %id, reason, "timeout restart skipped");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}
