// src/engine/run.rs

//! Run continuation: creating a run's processes from partitioned inputs and
//! the single re-entry point used both for the initial start and for every
//! subsequent "something changed" signal.

use chrono::Utc;
use tracing::{debug, info};

use crate::errors::{Result, TaskloomError};
use crate::model::{ProcessStatus, RunRecord, RunStatus, TaskDefinition};
use crate::store::RunSeed;
use crate::types::{ArtifactId, NodeId, RunId, TaskDefId, WorkerContext, WorkflowRunId};

use super::{Engine, process_key, run_key};

impl Engine {
    /// Create a pending run and its processes without dispatching anything.
    pub async fn prepare_run(
        &self,
        task_def_id: TaskDefId,
        inputs: Vec<ArtifactId>,
        ctx: &WorkerContext,
    ) -> Result<RunRecord> {
        self.prepare_run_inner(task_def_id, inputs, None, None, "start", ctx)
            .await
    }

    /// Prepare a run, mark it started, and continue it (dispatching whatever
    /// the slot limits allow).
    pub async fn start_run(
        &self,
        task_def_id: TaskDefId,
        inputs: Vec<ArtifactId>,
        ctx: &WorkerContext,
    ) -> Result<RunRecord> {
        let run = self.prepare_run(task_def_id, inputs, ctx).await?;

        {
            let _guard = self.inner.locks.acquire(&run_key(run.id)).await?;
            let mut run = self.store().run(run.id).await?;
            run.started_at = Some(Utc::now());
            self.store().save_run(run).await?;
        }

        self.continue_run(run.id).await?;
        self.store().run(run.id).await
    }

    /// Re-entry point for the initial start and every "something changed"
    /// signal: time out overdue processes regardless of slot pressure, then
    /// hand the run to the dispatcher to launch pending processes within
    /// slot limits.
    pub async fn continue_run(&self, id: RunId) -> Result<()> {
        {
            let _guard = self.inner.locks.acquire(&run_key(id)).await?;
            let store = self.store();
            let run = store.run(id).await?;
            if matches!(run.status(), RunStatus::Stopped | RunStatus::Failed) {
                debug!(run = %id, status = ?run.status(), "run cannot continue");
                return Ok(());
            }
            let processes = store.processes_of_run(id).await?;
            if processes.is_empty() {
                debug!(run = %id, "run has no processes; nothing to continue");
                return Ok(());
            }

            // The timeout sweep is unconditional here; the dispatcher only
            // sweeps while it has slots to hand out.
            if let Some(limit) = store.task_definition(run.task_def_id).await?.timeout_after_seconds
            {
                let now = Utc::now();
                for process in processes {
                    if process.status() == ProcessStatus::Running
                        && process.past_deadline(limit, now)
                    {
                        self.timeout_and_maybe_restart(process.id).await?;
                    }
                }
            }
        }

        self.dispatch_for_run(id).await
    }

    /// Throw away a run's processes and outputs and rebuild it from fresh
    /// inputs. For workflow-bound runs the inputs are re-collected from
    /// upstream completed nodes and the workflow is reopened if it had
    /// already completed.
    pub async fn restart_run(&self, id: RunId, ctx: &WorkerContext) -> Result<()> {
        let workflow_id = {
            let _guard = self.inner.locks.acquire(&run_key(id)).await?;
            let store = self.store();
            let mut run = store.run(id).await?;
            let def = store.task_definition(run.task_def_id).await?;

            store.delete_processes_of_run(id).await?;
            run.output_artifacts.clear();

            if let (Some(wf), Some(node)) = (run.workflow_run_id, run.workflow_node_id) {
                run.input_artifacts = self.collect_upstream_outputs(wf, node).await?;
            }

            run.clear_terminal_stamps();
            store.save_run(run.clone()).await?;
            info!(run = %id, "run restarted; re-partitioning inputs");

            let inputs = run.input_artifacts.clone();
            self.partition_and_prepare(&run, &def, &inputs, "restart", ctx)
                .await?;
            run.workflow_run_id
        };

        if let Some(workflow_id) = workflow_id {
            let _guard = self
                .inner
                .locks
                .acquire(&super::workflow_key(workflow_id))
                .await?;
            let store = self.store();
            let mut workflow = store.workflow_run(workflow_id).await?;
            if workflow.completed_at.is_some() {
                workflow.completed_at = None;
                store.save_workflow_run(workflow).await?;
                debug!(workflow = %workflow_id, run = %id, "workflow reopened by run restart");
            }
        }

        self.continue_run(id).await
    }

    /// Clear a stopped/failed run's terminal stamps, resume its stopped
    /// children, and continue it.
    pub async fn resume_run(&self, id: RunId) -> Result<()> {
        {
            let _guard = self.inner.locks.acquire(&run_key(id)).await?;
            let store = self.store();
            let mut run = store.run(id).await?;
            match run.status() {
                RunStatus::Stopped | RunStatus::Failed => {}
                status => {
                    return Err(TaskloomError::Conflict(format!(
                        "run {id} cannot be resumed from {status:?}"
                    )));
                }
            }
            run.stopped_at = None;
            run.failed_at = None;
            store.save_run(run).await?;

            // Only children that were themselves stopped come back.
            for child in store.processes_of_run(id).await? {
                if child.status() != ProcessStatus::Stopped {
                    continue;
                }
                let _pg = self.inner.locks.acquire(&process_key(child.id)).await?;
                let mut child = store.process(child.id).await?;
                if child.status() == ProcessStatus::Stopped {
                    child.clear_all_stamps();
                    store.save_process(child).await?;
                }
            }
            info!(run = %id, "run resumed");
        }

        self.continue_run(id).await
    }

    /// Stop a run and its in-flight children. Idempotent. Pending children
    /// stay pending; the stopped run blocks their dispatch.
    pub async fn stop_run(&self, id: RunId) -> Result<()> {
        let mut to_cancel = Vec::new();
        {
            let _guard = self.inner.locks.acquire(&run_key(id)).await?;
            let store = self.store();
            let mut run = store.run(id).await?;
            if run.stopped_at.is_none() {
                run.stopped_at = Some(Utc::now());
                store.save_run(run).await?;
                info!(run = %id, "run stopped");
            }

            // Only children that were started or dispatched get stopped.
            for child in store.processes_of_run(id).await? {
                if child.status().is_terminal() {
                    continue;
                }
                if child.started_at.is_some() || child.dispatched_at.is_some() {
                    let _pg = self.inner.locks.acquire(&process_key(child.id)).await?;
                    let mut child = store.process(child.id).await?;
                    if child.stopped_at.is_none() {
                        child.stopped_at = Some(Utc::now());
                        store.save_process(child.clone()).await?;
                    }
                    to_cancel.push(child.id);
                }
            }
        }

        for process in to_cancel {
            self.inner.cancels.cancel(process);
        }
        Ok(())
    }

    /// Create the run row and one process per (assigned worker × artifact
    /// group). Used by start, restart, and the workflow continuation.
    pub(crate) async fn prepare_run_inner(
        &self,
        task_def_id: TaskDefId,
        inputs: Vec<ArtifactId>,
        workflow_run_id: Option<WorkflowRunId>,
        workflow_node_id: Option<NodeId>,
        origin: &str,
        ctx: &WorkerContext,
    ) -> Result<RunRecord> {
        let store = self.store();
        let def = store.task_definition(task_def_id).await?;
        let run = store
            .insert_run(RunSeed {
                task_def_id,
                workflow_run_id,
                workflow_node_id,
                input_artifacts: inputs.clone(),
            })
            .await?;
        debug!(run = %run.id, task = %def.name, "run created");

        self.partition_and_prepare(&run, &def, &inputs, origin, ctx)
            .await?;
        store.run(run.id).await
    }

    async fn partition_and_prepare(
        &self,
        run: &RunRecord,
        def: &TaskDefinition,
        inputs: &[ArtifactId],
        origin: &str,
        ctx: &WorkerContext,
    ) -> Result<()> {
        let runner = self.runner_for(def)?;
        let groups = runner
            .partition(&self.runner_ctx(ctx), inputs)
            .await
            .map_err(TaskloomError::from)?;
        let groups = if groups.is_empty() {
            vec![Vec::new()]
        } else {
            groups
        };

        if def.assigned_workers.is_empty() {
            // No assigned workers: a single unassigned process per group.
            for group in &groups {
                self.prepare_process(run.id, None, group, origin, ctx).await?;
            }
        } else {
            for worker in &def.assigned_workers {
                for group in &groups {
                    self.prepare_process(run.id, Some(worker.clone()), group, origin, ctx)
                        .await?;
                }
            }
        }
        Ok(())
    }
}
