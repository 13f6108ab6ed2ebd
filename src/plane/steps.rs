//! Controller-side step transitions.

use async_trait::async_trait;

use super::context::{StepContext, StepWork, TaskWork, ACTIVE, DUE, WAITING};
use crate::error::Result;
use crate::pipeline::{ListName, Transition};
use crate::status::{JobStatus, Lifecycle, StepStatus};

/// Take a step out of the pipeline once it is terminal or its job is.
///
/// A step whose job ended before the step started is canceled here; tasks of
/// a started step are marked for cancellation and left to the task pipeline.
pub struct RetireStep;

#[async_trait]
impl Transition<StepWork, StepContext> for RetireStep {
    fn name(&self) -> &'static str {
        "retire_step"
    }

    fn sources(&self) -> &[ListName] {
        &[WAITING, ACTIVE]
    }

    fn target(&self) -> Option<ListName> {
        None
    }

    async fn valid(&self, work: &StepWork, ctx: &StepContext) -> bool {
        let units = ctx.plane.units.read().await;
        match (units.step(&work.step_id), units.job(&work.job_id)) {
            (Some(step), Some(job)) => step.status.is_terminal() || job.is_final(),
            _ => true,
        }
    }

    async fn processing(&self, work: StepWork, ctx: &StepContext) -> Result<StepWork> {
        let plane = &ctx.plane;
        let guard = plane.propagator.lock(work.job_id).await;
        let mut units = plane.units.write().await;
        let Some(step) = units.step(&work.step_id) else {
            return Ok(work);
        };
        if step.status == StepStatus::Created {
            plane
                .propagator
                .cancel_step(&guard, &mut units, work.step_id)?;
        }
        let unfinished: Vec<_> = units
            .tasks_of(&work.step_id)
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        for task_id in unfinished {
            plane.cancellations.mark(task_id);
        }
        tracing::debug!(step_id = %work.step_id, "Step retired");
        Ok(work)
    }
}

/// Start a step once it is first in line or its predecessor succeeded:
/// the job moves to scheduling and every task is admitted as due.
pub struct TriggerStep;

#[async_trait]
impl Transition<StepWork, StepContext> for TriggerStep {
    fn name(&self) -> &'static str {
        "trigger_step"
    }

    fn sources(&self) -> &[ListName] {
        &[WAITING]
    }

    fn target(&self) -> Option<ListName> {
        Some(ACTIVE)
    }

    async fn valid(&self, work: &StepWork, ctx: &StepContext) -> bool {
        let units = ctx.plane.units.read().await;
        let (Some(step), Some(job)) = (units.step(&work.step_id), units.job(&work.job_id)) else {
            return false;
        };
        if step.status != StepStatus::Created || job.is_final() || !job.is_split() {
            return false;
        }
        match units.predecessor(&work.step_id) {
            Some(previous) => previous.status == StepStatus::Success,
            None => true,
        }
    }

    async fn processing(&self, work: StepWork, ctx: &StepContext) -> Result<StepWork> {
        let plane = &ctx.plane;
        let due: Vec<TaskWork> = {
            let guard = plane.propagator.lock(work.job_id).await;
            let mut units = plane.units.write().await;
            if units.require_job(&work.job_id)?.status == JobStatus::Split {
                plane
                    .propagator
                    .set_job_status(&guard, &mut units, JobStatus::Scheduling)?;
            }
            units
                .tasks_of(&work.step_id)
                .into_iter()
                .filter(|t| !t.status.is_terminal())
                .map(TaskWork::new)
                .collect()
        };

        let mut admitted = 0;
        for task in due {
            if ctx.tasks.admit(DUE, task).await? {
                admitted += 1;
            }
        }
        tracing::info!(step_id = %work.step_id, job_id = %work.job_id, tasks = admitted, "Step triggered");
        Ok(work)
    }
}
