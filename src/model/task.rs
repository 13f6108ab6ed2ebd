use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DataSlice, JobId, RunId, StepId, TaskId};
use crate::pool::ResourceRequest;
use crate::status::TaskStatus;

/// Smallest schedulable unit. Executed by one Run per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub step_id: StepId,
    pub index: u32,
    /// Request as shaped by the pool when the task was created.
    pub resources: ResourceRequest,
    pub slice: Option<DataSlice>,
    pub max_retries: u32,
    pub retries: u32,
    /// 1-based; bumped on every retry.
    pub attempt: u32,
    /// Every run ever created for this task, oldest first.
    pub runs: Vec<RunId>,
    pub status: TaskStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        job_id: JobId,
        step_id: StepId,
        index: u32,
        resources: ResourceRequest,
        slice: Option<DataSlice>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            step_id,
            index,
            resources,
            slice,
            max_retries,
            retries: 0,
            attempt: 1,
            runs: Vec::new(),
            status: TaskStatus::Created,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    /// The run of the latest attempt, if one was created.
    pub fn current_run(&self) -> Option<RunId> {
        self.runs.last().copied()
    }

    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Consume a retry and move on to the next attempt.
    pub fn next_attempt(&mut self) {
        self.retries += 1;
        self.attempt += 1;
    }
}
