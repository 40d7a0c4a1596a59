// src/engine/lifecycle.rs

//! Process lifecycle: the state transitions of a single unit of execution.
//!
//! Every transition here records its timestamp *before* re-raising any
//! runner failure, so state stays consistent even when callers drop the
//! error. Execution itself happens outside every mutex: the locks only
//! serialize the decisions around it.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::{Result, TaskloomError};
use crate::model::{ProcessRecord, ProcessStatus};
use crate::store::ProcessSeed;
use crate::types::{ArtifactId, ProcessId, RunId, WorkerContext, WorkerId};

use super::{Engine, process_key, run_key};

impl Engine {
    /// Create a process for `run_id`, adopt its input artifacts, and let the
    /// runner stage whatever execution needs.
    ///
    /// Artifacts not owned by the run's task definition are deep-copied
    /// (with their child trees) so processes never share mutable state with
    /// a different run. On runner failure the process is marked incomplete
    /// and the failure re-raised; the process mutex is released either way.
    pub async fn prepare_process(
        &self,
        run_id: RunId,
        worker: Option<WorkerId>,
        inputs: &[ArtifactId],
        origin: &str,
        ctx: &WorkerContext,
    ) -> Result<ProcessRecord> {
        let store = self.store();
        let run = store.run(run_id).await?;
        let def = store.task_definition(run.task_def_id).await?;
        let runner = self.runner_for(&def)?;

        let mut process = store
            .insert_process(ProcessSeed {
                run_id,
                assigned_worker: worker,
                origin: origin.to_string(),
                input_artifacts: Vec::new(),
                output_binding: None,
                restart_count: 0,
            })
            .await?;

        let _guard = self.inner.locks.acquire(&process_key(process.id)).await?;

        let mut adopted = Vec::with_capacity(inputs.len());
        for artifact_id in inputs {
            let artifact = store.artifact(*artifact_id).await?;
            if artifact.task_def_id == Some(def.id) {
                adopted.push(*artifact_id);
            } else {
                let copy = store.deep_copy_artifact(*artifact_id, def.id).await?;
                debug!(artifact = %artifact_id, copy = %copy, "copied cross-definition artifact");
                adopted.push(copy);
            }
        }
        process.input_artifacts = adopted;
        store.save_process(process.clone()).await?;

        let rctx = self.runner_ctx(ctx);
        if let Err(error) = runner.prepare(&rctx, &process).await {
            let retryable = self.inner.classifier.is_retryable(&error);
            process.incomplete_at = Some(Utc::now());
            process.error_count += 1;
            store.save_process(process.clone()).await?;
            warn!(
                process = %process.id,
                run = %run_id,
                error = %error,
                "runner preparation failed"
            );
            return Err(TaskloomError::Execution {
                retryable,
                source: error,
            });
        }

        process.is_ready = true;
        store.save_process(process.clone()).await?;
        debug!(process = %process.id, run = %run_id, origin, "process prepared");
        Ok(process)
    }

    /// Execute a process via its runner.
    ///
    /// Idempotent: a process that is not in a runnable state (already
    /// running, finished, stopped, not yet prepared) is skipped without
    /// error, so two consumers dequeuing the same id race harmlessly.
    pub async fn run_process(&self, id: ProcessId, ctx: &WorkerContext) -> Result<()> {
        let store = self.store();
        let peek = store.process(id).await?;

        // Barrier on the owning run: any preparation or continuation
        // decision still holding the run mutex finishes before we judge
        // runnability. Acquire-then-release only; execution must not hold
        // run-wide locks.
        drop(self.inner.locks.acquire(&run_key(peek.run_id)).await?);

        let (process, runner) = {
            let _guard = self.inner.locks.acquire(&process_key(id)).await?;
            let mut process = store.process(id).await?;
            let runnable = !process.superseded
                && process.is_ready
                && matches!(
                    process.status(),
                    ProcessStatus::Pending | ProcessStatus::Dispatched
                );
            if !runnable {
                debug!(
                    process = %id,
                    status = ?process.status(),
                    "process not runnable; skipping execution"
                );
                return Ok(());
            }

            let run = store.run(process.run_id).await?;
            if run.status().blocks_dispatch() {
                debug!(process = %id, run = %run.id, "owning run blocks execution; skipping");
                return Ok(());
            }
            let def = store.task_definition(run.task_def_id).await?;
            let runner = self.runner_for(&def)?;

            process.started_at = Some(Utc::now());
            process.invoked_by = ctx.job_id.clone();
            store.save_process(process.clone()).await?;
            (process, runner)
        };

        let rctx = self.runner_ctx(ctx);
        let mut cancel_rx = self.inner.cancels.register(id);
        info!(process = %id, run = %process.run_id, "executing process");

        let outcome = tokio::select! {
            result = runner.execute(&rctx, &process) => Some(result),
            _ = &mut cancel_rx => None,
        };
        self.inner.cancels.clear(id);

        match outcome {
            None => {
                info!(process = %id, "execution interrupted by stop request");
                Ok(())
            }
            Some(Ok(())) => self.complete_process(id).await,
            Some(Err(error)) => {
                let retryable = self.inner.classifier.is_retryable(&error);
                self.record_execution_failure(id, retryable).await?;
                Err(TaskloomError::Execution {
                    retryable,
                    source: error,
                })
            }
        }
    }

    /// Mark a process completed, clearing failure stamps so `completed_at`
    /// is the only terminal timestamp, then signal the dispatcher to look
    /// for more work on the owning run.
    ///
    /// Calling this twice leaves state identical to calling it once.
    pub async fn complete_process(&self, id: ProcessId) -> Result<()> {
        let store = self.store();
        let run_id = {
            let _guard = self.inner.locks.acquire(&process_key(id)).await?;
            let mut process = store.process(id).await?;
            if process.status() == ProcessStatus::Completed {
                debug!(process = %id, "already completed");
            } else {
                process.clear_failure_stamps();
                process.completed_at = Some(Utc::now());
                store.save_process(process.clone()).await?;
                info!(process = %id, run = %process.run_id, "process completed");
            }
            process.run_id
        };

        self.finish_run_if_complete(run_id).await?;
        self.dispatch_signal(run_id).await;
        Ok(())
    }

    /// Replace a process with a fresh record, tombstoning the old one.
    ///
    /// Restart is not preemption: a currently running process is a
    /// conflict. The replacement re-associates (not re-copies) the same
    /// input artifacts and carries the output binding forward; every
    /// previously superseded predecessor is re-pointed at the new record so
    /// the chain stays one hop deep.
    pub async fn restart_process(&self, id: ProcessId) -> Result<ProcessRecord> {
        let replacement = self.restart_process_inner(id).await?;
        self.dispatch_for_run(replacement.run_id).await?;
        Ok(replacement)
    }

    pub(crate) async fn restart_process_inner(&self, id: ProcessId) -> Result<ProcessRecord> {
        let store = self.store();
        let _guard = self.inner.locks.acquire(&process_key(id)).await?;

        let mut old = store.process(id).await?;
        if old.status() == ProcessStatus::Running {
            return Err(TaskloomError::Conflict(format!(
                "process {id} is currently running and cannot be restarted"
            )));
        }
        if old.superseded {
            return Err(TaskloomError::Conflict(format!(
                "process {id} was already superseded by a restart"
            )));
        }

        self.inner.cancels.cancel(id);

        let mut replacement = store
            .insert_process(ProcessSeed {
                run_id: old.run_id,
                assigned_worker: old.assigned_worker.clone(),
                origin: "restart".to_string(),
                input_artifacts: old.input_artifacts.clone(),
                output_binding: old.output_binding.clone(),
                restart_count: old.restart_count + 1,
            })
            .await?;
        // Preparation already ran for this lineage; the replacement is
        // dispatchable as soon as slots allow.
        replacement.is_ready = old.is_ready;
        store.save_process(replacement.clone()).await?;

        old.superseded = true;
        old.replaced_by = Some(replacement.id);
        store.save_process(old.clone()).await?;

        // Keep the chain flat: every tombstone points at the active record.
        for mut predecessor in store.chain_predecessors(old.id).await? {
            predecessor.replaced_by = Some(replacement.id);
            store.save_process(predecessor).await?;
        }

        info!(
            process = %id,
            replacement = %replacement.id,
            restart_count = replacement.restart_count,
            "process restarted"
        );
        Ok(replacement)
    }

    /// Return a stopped/failed/incomplete/timed-out process to pending.
    ///
    /// All stamps are cleared, including `started_at` and `completed_at`,
    /// forcing genuine re-execution rather than resume-in-place.
    pub async fn resume_process(&self, id: ProcessId) -> Result<()> {
        let run_id = {
            let _guard = self.inner.locks.acquire(&process_key(id)).await?;
            let mut process = self.store().process(id).await?;
            match process.status() {
                ProcessStatus::Stopped
                | ProcessStatus::Failed
                | ProcessStatus::Incomplete
                | ProcessStatus::TimedOut => {}
                status => {
                    return Err(TaskloomError::Conflict(format!(
                        "process {id} cannot be resumed from {status:?}"
                    )));
                }
            }
            process.clear_all_stamps();
            self.store().save_process(process.clone()).await?;
            info!(process = %id, "process resumed to pending");
            process.run_id
        };

        self.dispatch_for_run(run_id).await
    }

    /// Stop a process and interrupt any in-flight execution. Idempotent;
    /// stop prevents future dispatch but does not guarantee an instant halt
    /// of a runner that never yields.
    pub async fn stop_process(&self, id: ProcessId) -> Result<()> {
        {
            let _guard = self.inner.locks.acquire(&process_key(id)).await?;
            let mut process = self.store().process(id).await?;
            if process.stopped_at.is_none() {
                process.stopped_at = Some(Utc::now());
                self.store().save_process(process).await?;
                info!(process = %id, "process stopped");
            }
        }
        self.inner.cancels.cancel(id);
        Ok(())
    }

    /// Record a timeout on a pending/dispatched/running process and report
    /// whether it is eligible for an automatic restart. Callers that get
    /// `true` are expected to restart it.
    pub async fn mark_process_timed_out(&self, id: ProcessId) -> Result<bool> {
        let store = self.store();
        let _guard = self.inner.locks.acquire(&process_key(id)).await?;

        let mut process = store.process(id).await?;
        match process.status() {
            ProcessStatus::Pending | ProcessStatus::Dispatched | ProcessStatus::Running => {}
            status => {
                return Err(TaskloomError::Conflict(format!(
                    "process {id} cannot time out from {status:?}"
                )));
            }
        }

        process.timeout_at = Some(Utc::now());
        store.save_process(process.clone()).await?;
        self.inner.cancels.cancel(id);

        let run = store.run(process.run_id).await?;
        let def = store.task_definition(run.task_def_id).await?;
        let eligible = process.restart_count < def.max_process_retries;
        warn!(
            process = %id,
            run = %process.run_id,
            restart_count = process.restart_count,
            eligible,
            "process timed out"
        );
        Ok(eligible)
    }

    /// Forward an externally-triggered event (e.g. a webhook) to the
    /// process's runner.
    pub async fn handle_runner_event(
        &self,
        id: ProcessId,
        payload: serde_json::Value,
        ctx: &WorkerContext,
    ) -> Result<()> {
        let store = self.store();
        let process = store.process(id).await?;
        let run = store.run(process.run_id).await?;
        let def = store.task_definition(run.task_def_id).await?;
        let runner = self.runner_for(&def)?;

        debug!(process = %id, "forwarding runner event");
        runner
            .on_event(&self.runner_ctx(ctx), &process, payload)
            .await
            .map_err(TaskloomError::from)
    }

    /// Record an execution failure on the process and bump the run's
    /// aggregate error count.
    async fn record_execution_failure(&self, id: ProcessId, retryable: bool) -> Result<()> {
        let store = self.store();
        let run_id = {
            let _guard = self.inner.locks.acquire(&process_key(id)).await?;
            let mut process = store.process(id).await?;
            process.error_count += 1;
            let now = Utc::now();
            if retryable {
                process.incomplete_at = Some(now);
            } else {
                process.failed_at = Some(now);
            }
            store.save_process(process.clone()).await?;
            warn!(process = %id, retryable, "recorded execution failure");
            process.run_id
        };

        let _guard = self.inner.locks.acquire(&run_key(run_id)).await?;
        let mut run = store.run(run_id).await?;
        run.error_count += 1;
        store.save_run(run).await?;
        Ok(())
    }

    /// Mark the owning run completed once every live child process is
    /// completed, and hand workflow-bound runs to the workflow continuation.
    pub(crate) async fn finish_run_if_complete(&self, run_id: RunId) -> Result<()> {
        let store = self.store();
        let newly_completed = {
            let _guard = self.inner.locks.acquire(&run_key(run_id)).await?;
            let mut run = store.run(run_id).await?;
            if run.completed_at.is_some() || run.stopped_at.is_some() || run.failed_at.is_some() {
                None
            } else {
                let processes = store.processes_of_run(run_id).await?;
                let all_done = !processes.is_empty()
                    && processes
                        .iter()
                        .all(|p| p.status() == ProcessStatus::Completed);
                if all_done {
                    run.completed_at = Some(Utc::now());
                    store.save_run(run.clone()).await?;
                    info!(run = %run_id, "run completed");
                    Some(run)
                } else {
                    None
                }
            }
        };

        if let Some(run) = newly_completed {
            if run.workflow_run_id.is_some() {
                self.on_workflow_run_complete(&run).await?;
            }
        }
        Ok(())
    }
}
