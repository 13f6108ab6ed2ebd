//! Controller-side task transitions.
//!
//! Order matters: a pending cancellation wins over everything, a terminal
//! task leaves the pipeline, a task on a newer attempt goes back to `due`,
//! and only then is a launch considered.

use async_trait::async_trait;
use uuid::Uuid;

use super::context::{PlaneContext, TaskWork, DUE, LAUNCHED};
use crate::error::{PlaneError, Result};
use crate::model::{Run, RunSpec};
use crate::pipeline::{ListName, Transition};
use crate::scheduler::RunReport;
use crate::status::{Lifecycle, RunStatus, TaskStatus};

/// Stop the current run and mark the task canceled.
pub struct CancelTask;

#[async_trait]
impl Transition<TaskWork, PlaneContext> for CancelTask {
    fn name(&self) -> &'static str {
        "cancel_task"
    }

    fn sources(&self) -> &[ListName] {
        &[DUE, LAUNCHED]
    }

    fn target(&self) -> Option<ListName> {
        None
    }

    async fn valid(&self, work: &TaskWork, ctx: &PlaneContext) -> bool {
        ctx.cancellations.contains(&work.task_id)
    }

    async fn processing(&self, work: TaskWork, ctx: &PlaneContext) -> Result<TaskWork> {
        let run = ctx.units.read().await.current_run(&work.task_id).cloned();
        if let Some(run) = run.as_ref().filter(|r| !r.status.is_terminal()) {
            let backend = ctx.backends.get(run.spec.backend)?;
            if backend.stop(run).await?.is_none() {
                tracing::debug!(run_id = %run.id, "Backend has no such run, nothing to stop");
            }
        }

        {
            let guard = ctx.propagator.lock(work.job_id).await;
            let mut units = ctx.units.write().await;
            if let Some(run) = &run {
                units.close_run(&run.id, RunStatus::Canceled, None);
            }
            let task_done = units
                .task(&work.task_id)
                .map_or(true, |t| t.status.is_terminal());
            if !task_done {
                ctx.propagator.set_task_status(
                    &guard,
                    &mut units,
                    work.task_id,
                    TaskStatus::Canceled,
                    None,
                )?;
            }
        }

        if let Some(run) = &run {
            if let Err(e) = ctx.backends.get(run.spec.backend)?.remove(run).await {
                tracing::warn!(run_id = %run.id, error = %e, "Failed to release canceled run");
            }
        }
        tracing::info!(task_id = %work.task_id, "Task canceled");
        Ok(work)
    }

    async fn success(&self, _before: &TaskWork, after: &TaskWork, ctx: &PlaneContext) {
        ctx.cancellations.clear(&after.task_id);
    }
}

/// Take a terminal task out of the pipeline and release its run.
pub struct FinishTask;

#[async_trait]
impl Transition<TaskWork, PlaneContext> for FinishTask {
    fn name(&self) -> &'static str {
        "finish_task"
    }

    fn sources(&self) -> &[ListName] {
        &[DUE, LAUNCHED]
    }

    fn target(&self) -> Option<ListName> {
        None
    }

    async fn valid(&self, work: &TaskWork, ctx: &PlaneContext) -> bool {
        ctx.units
            .read()
            .await
            .task(&work.task_id)
            .map_or(true, |t| t.status.is_terminal())
    }

    async fn processing(&self, work: TaskWork, ctx: &PlaneContext) -> Result<TaskWork> {
        let run = ctx.units.read().await.current_run(&work.task_id).cloned();
        if let Some(run) = run {
            ctx.backends.get(run.spec.backend)?.remove(&run).await?;
        }
        Ok(work)
    }
}

/// A failed attempt was retried: forget the old run and launch again.
pub struct RelaunchTask;

#[async_trait]
impl Transition<TaskWork, PlaneContext> for RelaunchTask {
    fn name(&self) -> &'static str {
        "relaunch_task"
    }

    fn sources(&self) -> &[ListName] {
        &[DUE, LAUNCHED]
    }

    fn target(&self) -> Option<ListName> {
        Some(DUE)
    }

    async fn valid(&self, work: &TaskWork, ctx: &PlaneContext) -> bool {
        ctx.units
            .read()
            .await
            .task(&work.task_id)
            .is_some_and(|t| t.attempt > work.attempt)
    }

    async fn processing(&self, mut work: TaskWork, ctx: &PlaneContext) -> Result<TaskWork> {
        let (previous, attempt) = {
            let units = ctx.units.read().await;
            let task = units.require_task(&work.task_id)?;
            let previous = work.run_id.and_then(|id| units.run(&id)).cloned();
            (previous, task.attempt)
        };
        if let Some(run) = previous {
            match ctx.backends.get(run.spec.backend) {
                Ok(backend) => {
                    if let Err(e) = backend.remove(&run).await {
                        tracing::warn!(run_id = %run.id, error = %e, "Failed to release previous run");
                    }
                }
                Err(e) => tracing::warn!(run_id = %run.id, error = %e, "Cannot release previous run"),
            }
        }
        tracing::info!(task_id = %work.task_id, attempt, "Task due for another attempt");
        work.attempt = attempt;
        work.run_id = None;
        Ok(work)
    }
}

/// Validate the request, create the run and hand it to the pool's backend.
pub struct LaunchTask;

#[async_trait]
impl Transition<TaskWork, PlaneContext> for LaunchTask {
    fn name(&self) -> &'static str {
        "launch_task"
    }

    fn sources(&self) -> &[ListName] {
        &[DUE]
    }

    fn target(&self) -> Option<ListName> {
        Some(LAUNCHED)
    }

    async fn valid(&self, work: &TaskWork, ctx: &PlaneContext) -> bool {
        if ctx.cancellations.contains(&work.task_id) {
            return false;
        }
        let units = ctx.units.read().await;
        let (Some(task), Some(step), Some(job)) = (
            units.task(&work.task_id),
            units.step(&work.step_id),
            units.job(&work.job_id),
        ) else {
            return false;
        };
        if task.status.is_terminal() || job.is_final() || task.attempt != work.attempt {
            return false;
        }
        // a task already holding a slot keeps it across attempts
        if task.status.is_active() {
            return true;
        }
        if !step.has_slot(units.active_in_step(&step.id)) {
            return false;
        }
        match ctx.pools.get(&job.pool).and_then(|p| p.max_running) {
            Some(limit) => units.active_in_pool(&job.pool) < limit as usize,
            None => true,
        }
    }

    fn pre(&self, work: &TaskWork, _ctx: &PlaneContext) -> TaskWork {
        let mut staged = work.clone();
        if staged.run_id.is_none() {
            staged.run_id = Some(Uuid::new_v4());
        }
        staged
    }

    async fn processing(&self, work: TaskWork, ctx: &PlaneContext) -> Result<TaskWork> {
        let run_id = work
            .run_id
            .ok_or_else(|| PlaneError::Internal("launch without a planned run".to_string()))?;

        let run = {
            let guard = ctx.propagator.lock(work.job_id).await;
            let mut units = ctx.units.write().await;
            let status = units.require_task(&work.task_id)?.status;
            if status.is_terminal() {
                // settled since the guard ran; finish_task takes it from here
                return Ok(work);
            }
            if status == TaskStatus::Created {
                ctx.propagator.set_task_status(
                    &guard,
                    &mut units,
                    work.task_id,
                    TaskStatus::Preparing,
                    None,
                )?;
            }

            let existing = units.run(&run_id).cloned();
            match existing {
                Some(run) => run,
                None => {
                    let job = units.require_job(&work.job_id)?;
                    let task = units.require_task(&work.task_id)?;
                    let shaped = ctx.pools.validate(&job.pool, &task.resources);
                    let (pool, resources) = match shaped {
                        Ok(shaped) => shaped,
                        Err(e) if e.is_validation() => {
                            tracing::warn!(task_id = %work.task_id, error = %e, "Resource request rejected at launch");
                            ctx.propagator.set_task_status(
                                &guard,
                                &mut units,
                                work.task_id,
                                TaskStatus::Fail,
                                Some(e.to_string()),
                            )?;
                            return Ok(work);
                        }
                        Err(e) => return Err(e),
                    };
                    let step = units.require_step(&work.step_id)?;
                    let spec = RunSpec::for_task(job, step, task, &pool, resources);
                    let run = Run::new(run_id, task, spec);
                    units.insert_run(run.clone())?;
                    run
                }
            }
        };

        let backend = ctx.backends.get(run.spec.backend)?;
        match backend.probe(&run).await? {
            Some(status) if status.is_terminal() => {
                // finished while nobody was watching
                tracing::info!(run_id = %run.id, status = %status, "Adopting finished run");
                ctx.reports.deliver(RunReport::new(run.id, status)).await?;
            }
            Some(status) => {
                tracing::info!(run_id = %run.id, status = %status, "Adopting live run");
                if backend.attach(&run, ctx.reports.clone()).await?.is_none() {
                    backend.run(&run, ctx.reports.clone()).await?;
                }
            }
            None => {
                backend.run(&run, ctx.reports.clone()).await?;
                tracing::info!(
                    task_id = %work.task_id,
                    run_id = %run.id,
                    backend = %run.spec.backend,
                    attempt = run.attempt,
                    "Run started"
                );
            }
        }
        Ok(work)
    }

    async fn fail(&self, work: &TaskWork, ctx: &PlaneContext, error: &PlaneError) {
        tracing::warn!(task_id = %work.task_id, error = %error, "Launch failed");
        // the tick aborts on infrastructure errors and retries the launch as is
        if error.is_validation() || error.is_infrastructure() {
            return;
        }
        if let Err(e) = ctx.record_dispatch_failure(work, &error.to_string()).await {
            tracing::error!(task_id = %work.task_id, error = %e, "Failed to record launch failure");
        }
    }
}
