use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PlaneError, Result};
use crate::model::{JobId, RunId, StepId, Task, TaskId, UnitStore};
use crate::pipeline::{ListName, Pipeline, WorkItem};
use crate::pool::PoolRegistry;
use crate::propagate::Propagator;
use crate::scheduler::{BackendRegistry, ReportReceiver};
use crate::status::{Lifecycle, RunStatus, TaskStatus};

/// Tasks waiting for a launch slot, or relaunch after a failed attempt.
pub const DUE: ListName = "due";
/// Tasks with a run handed to a backend.
pub const LAUNCHED: ListName = "launched";
/// Steps not yet triggered.
pub const WAITING: ListName = "waiting";
/// Steps whose tasks are in the task pipeline.
pub const ACTIVE: ListName = "active";

pub const TASK_LISTS: [ListName; 2] = [DUE, LAUNCHED];
pub const STEP_LISTS: [ListName; 2] = [WAITING, ACTIVE];

/// Task pipeline entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskWork {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub step_id: StepId,
    /// Attempt this entry is launching.
    pub attempt: u32,
    /// Planned before the backend call so a resumed launch reuses it.
    pub run_id: Option<RunId>,
}

impl TaskWork {
    pub fn new(task: &Task) -> Self {
        Self {
            task_id: task.id,
            job_id: task.job_id,
            step_id: task.step_id,
            attempt: task.attempt,
            run_id: None,
        }
    }
}

impl WorkItem for TaskWork {
    fn key(&self) -> Uuid {
        self.task_id
    }
}

/// Step pipeline entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepWork {
    pub step_id: StepId,
    pub job_id: JobId,
}

impl WorkItem for StepWork {
    fn key(&self) -> Uuid {
        self.step_id
    }
}

/// Tasks with a pending cancellation request.
#[derive(Debug, Default)]
pub struct CancelSet {
    tasks: Mutex<HashSet<TaskId>>,
}

impl CancelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, task_id: TaskId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_id)
    }

    pub fn clear(&self, task_id: &TaskId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handles shared by the controller and its task transitions.
#[derive(Clone)]
pub struct PlaneContext {
    pub units: Arc<RwLock<UnitStore>>,
    pub pools: Arc<PoolRegistry>,
    pub backends: BackendRegistry,
    pub propagator: Arc<Propagator>,
    pub cancellations: Arc<CancelSet>,
    pub reports: ReportReceiver,
}

impl PlaneContext {
    /// Count a failed launch against the task's retries. The planned run is
    /// closed as failed; the task either moves to its next attempt or fails.
    pub async fn record_dispatch_failure(&self, work: &TaskWork, reason: &str) -> Result<()> {
        let guard = self.propagator.lock(work.job_id).await;
        let mut units = self.units.write().await;
        if let Some(run_id) = work.run_id {
            units.close_run(&run_id, RunStatus::Fail, Some(reason.to_string()));
        }
        let task = units
            .task_mut(&work.task_id)
            .ok_or(PlaneError::TaskNotFound(work.task_id))?;
        if task.status.is_terminal() || task.attempt != work.attempt {
            return Ok(());
        }
        if task.can_retry() {
            task.next_attempt();
            tracing::warn!(
                task_id = %work.task_id,
                attempt = task.attempt,
                reason,
                "Launch failed, retrying with a new attempt"
            );
            return Ok(());
        }
        let status = task.status;
        if status == TaskStatus::Created {
            self.propagator.set_task_status(
                &guard,
                &mut units,
                work.task_id,
                TaskStatus::Preparing,
                None,
            )?;
        }
        self.propagator.set_task_status(
            &guard,
            &mut units,
            work.task_id,
            TaskStatus::Fail,
            Some(format!("launch failed: {}", reason)),
        )?;
        Ok(())
    }
}

/// Context of the step pipeline: the controller handles plus the task
/// pipeline that triggered steps feed.
#[derive(Clone)]
pub struct StepContext {
    pub plane: PlaneContext,
    pub tasks: Arc<Pipeline<TaskWork, PlaneContext>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_set_marks_once() {
        let set = CancelSet::new();
        let id = Uuid::new_v4();
        assert!(set.mark(id));
        assert!(!set.mark(id));
        assert!(set.contains(&id));
        assert!(set.clear(&id));
        assert!(set.is_empty());
    }
}
