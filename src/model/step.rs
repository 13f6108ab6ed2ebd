use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobId, StepId, StepSpec, TaskId};
use crate::status::StepStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    pub name: String,
    /// Position within the job, starting at 0.
    pub index: u32,
    pub template: StepSpec,
    pub tasks: Vec<TaskId>,
    /// Linear pipeline link; triggered once this step succeeds.
    pub next: Option<StepId>,
    pub max_running: Option<u32>,
    pub status: StepStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(job_id: JobId, index: u32, template: StepSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            name: template.name.clone(),
            index,
            max_running: template.max_running,
            template,
            tasks: Vec::new(),
            next: None,
            status: StepStatus::Created,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether one more task may start given `active` siblings already
    /// preparing or running.
    pub fn has_slot(&self, active: usize) -> bool {
        match self.max_running {
            Some(limit) => active < limit as usize,
            None => true,
        }
    }
}
