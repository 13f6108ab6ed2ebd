use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Job, JobId, RunId, Step, Task, TaskId};
use crate::pool::{ResourcePool, ResourceRequest};
use crate::scheduler::BackendKind;
use crate::status::RunStatus;

pub const ENV_JOB_ID: &str = "MLPLANE_JOB_ID";
pub const ENV_TASK_ID: &str = "MLPLANE_TASK_ID";
pub const ENV_TASK_INDEX: &str = "MLPLANE_TASK_INDEX";
pub const ENV_ATTEMPT: &str = "MLPLANE_ATTEMPT";
pub const ENV_DATASET_URI: &str = "MLPLANE_DATASET_URI";
pub const ENV_SLICE_OFFSET: &str = "MLPLANE_SLICE_OFFSET";
pub const ENV_SLICE_LEN: &str = "MLPLANE_SLICE_LEN";

/// Everything a backend needs to start a run. Carries a snapshot of the pool
/// as it was when the run was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceRequest,
    pub pool: String,
    pub node_selector: BTreeMap<String, String>,
    pub backend: BackendKind,
}

impl RunSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            resources: ResourceRequest::new(),
            pool: crate::pool::DEFAULT_POOL.to_string(),
            node_selector: BTreeMap::new(),
            backend: BackendKind::Docker,
        }
    }

    pub fn for_task(
        job: &Job,
        step: &Step,
        task: &Task,
        pool: &ResourcePool,
        resources: ResourceRequest,
    ) -> Self {
        let mut env = step.template.env.clone();
        env.insert(ENV_JOB_ID.into(), job.id.to_string());
        env.insert(ENV_TASK_ID.into(), task.id.to_string());
        env.insert(ENV_TASK_INDEX.into(), task.index.to_string());
        env.insert(ENV_ATTEMPT.into(), task.attempt.to_string());
        if let (Some(slice), Some(dataset)) = (task.slice, job.spec.dataset.as_ref()) {
            env.insert(ENV_DATASET_URI.into(), dataset.uri.clone());
            env.insert(ENV_SLICE_OFFSET.into(), slice.offset.to_string());
            env.insert(ENV_SLICE_LEN.into(), slice.len.to_string());
        }
        Self {
            image: step.template.image.clone(),
            command: step.template.command.clone(),
            env,
            resources,
            pool: pool.name.clone(),
            node_selector: pool.node_selector.clone(),
            backend: pool.backend,
        }
    }
}

/// One concrete execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub attempt: u32,
    pub spec: RunSpec,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub log_tail: Vec<String>,
    /// Where the full log ended up; the one field writable after finish.
    pub log_pointer: Option<String>,
}

impl Run {
    pub fn new(id: RunId, task: &Task, spec: RunSpec) -> Self {
        Self {
            id,
            task_id: task.id,
            job_id: task.job_id,
            attempt: task.attempt,
            spec,
            status: RunStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_reason: None,
            log_tail: Vec::new(),
            log_pointer: None,
        }
    }

    /// Name of the container or kubernetes job backing this run.
    pub fn container_name(&self) -> String {
        format!("mlplane-{}", self.id.simple())
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
