//! Applying backend observations to runs and their tasks.

use std::time::Duration;

use chrono::Utc;

use super::context::PlaneContext;
use crate::error::Result;
use crate::model::Run;
use crate::propagate::Propagation;
use crate::scheduler::RunReport;
use crate::status::{Lifecycle, RunStatus, TaskStatus};

/// Log lines kept per run.
pub const LOG_TAIL_LINES: usize = 200;

fn failure_reason(report: &RunReport) -> String {
    if let Some(reason) = &report.reason {
        return reason.clone();
    }
    match report.exit_code {
        Some(code) => format!("run {} exited with code {}", report.run_id, code),
        None => format!("run {} ended {}", report.run_id, report.status),
    }
}

/// Fold a report into the run. Returns false for duplicates and for reports
/// the run's state machine has already moved past.
fn record(run: &mut Run, report: &RunReport) -> bool {
    if run.status == report.status {
        return false;
    }
    if !run.status.can_transition_to(report.status) {
        tracing::debug!(
            run_id = %run.id,
            current = %run.status,
            reported = %report.status,
            "Stale run report ignored"
        );
        return false;
    }
    run.status = report.status;
    if report.status.task_view() == TaskStatus::Running && run.started_at.is_none() {
        run.started_at = Some(report.observed_at);
    }
    if report.exit_code.is_some() {
        run.exit_code = report.exit_code;
    }
    if report.status.is_terminal() {
        run.finished_at = Some(report.observed_at);
        if report.status.is_failure() {
            run.failure_reason = Some(failure_reason(report));
        }
    }
    run.log_tail.extend(report.log_lines.iter().cloned());
    if run.log_tail.len() > LOG_TAIL_LINES {
        let excess = run.log_tail.len() - LOG_TAIL_LINES;
        run.log_tail.drain(..excess);
    }
    true
}

/// Apply one report: update the run, then (for the task's current run only)
/// the task, retrying failed attempts while retries last.
///
/// Safe to repeat; a report applied twice changes nothing the second time.
pub async fn apply_report(ctx: &PlaneContext, report: RunReport) -> Result<Propagation> {
    let job_id = match ctx.units.read().await.run(&report.run_id) {
        Some(run) => run.job_id,
        None => {
            tracing::debug!(run_id = %report.run_id, "Report for unknown run ignored");
            return Ok(Propagation::default());
        }
    };
    let guard = ctx.propagator.lock(job_id).await;
    let mut units = ctx.units.write().await;

    let Some(run) = units.run_mut(&report.run_id) else {
        return Ok(Propagation::default());
    };
    if !record(run, &report) {
        return Ok(Propagation::default());
    }
    let (task_id, attempt) = (run.task_id, run.attempt);
    tracing::debug!(run_id = %report.run_id, status = %report.status, "Run report applied");

    let Some(task) = units.task_mut(&task_id) else {
        return Ok(Propagation::default());
    };
    if task.attempt != attempt || task.status.is_terminal() {
        // superseded attempt, or a task that was already settled
        return Ok(Propagation::default());
    }

    let target = report.status.task_view();
    if target == TaskStatus::Fail && task.can_retry() {
        task.next_attempt();
        tracing::warn!(
            task_id = %task_id,
            run_id = %report.run_id,
            attempt = task.attempt,
            reason = %failure_reason(&report),
            "Run failed, task will be retried"
        );
        return Ok(Propagation::default());
    }
    let current = task.status;
    if target == TaskStatus::Preparing && current != TaskStatus::Created {
        return Ok(Propagation::default());
    }

    let mut propagation = Propagation::default();
    if current == TaskStatus::Preparing && matches!(target, TaskStatus::Success | TaskStatus::Fail)
    {
        propagation.merge(ctx.propagator.set_task_status(
            &guard,
            &mut units,
            task_id,
            TaskStatus::Running,
            None,
        )?);
    }
    let reason = (target == TaskStatus::Fail).then(|| failure_reason(&report));
    propagation.merge(
        ctx.propagator
            .set_task_status(&guard, &mut units, task_id, target, reason)?,
    );
    Ok(propagation)
}

/// Fail every unfinished run older than `timeout`, as if its backend had
/// reported the failure, and ask the backend to stop it.
pub async fn expire_runs(ctx: &PlaneContext, timeout: Duration) -> Result<usize> {
    let now = Utc::now();
    let expired: Vec<Run> = ctx
        .units
        .read()
        .await
        .unfinished_runs()
        .into_iter()
        .filter(|run| {
            let since = run.started_at.unwrap_or(run.created_at);
            now.signed_duration_since(since)
                .to_std()
                .is_ok_and(|elapsed| elapsed > timeout)
        })
        .cloned()
        .collect();

    for run in &expired {
        tracing::warn!(run_id = %run.id, task_id = %run.task_id, "Run timed out");
        let report = RunReport::new(run.id, RunStatus::Fail)
            .with_reason(format!("run exceeded timeout of {}s", timeout.as_secs()));
        apply_report(ctx, report).await?;
        match ctx.backends.get(run.spec.backend) {
            Ok(backend) => {
                if let Err(e) = backend.stop(run).await {
                    tracing::warn!(run_id = %run.id, error = %e, "Failed to stop timed out run");
                }
            }
            Err(e) => tracing::warn!(run_id = %run.id, error = %e, "Cannot stop timed out run"),
        }
    }
    Ok(expired.len())
}
