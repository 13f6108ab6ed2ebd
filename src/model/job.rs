use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobId, StepId};
use crate::error::{PlaneError, Result};
use crate::pool::{ResourceRequest, DEFAULT_POOL};
use crate::status::{JobStatus, Lifecycle};

/// Input data a job's tasks partition between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub uri: String,
    pub items: u64,
}

/// How a step's tasks see the job dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Every task sees the whole dataset.
    #[default]
    Replicate,
    /// Each task gets a contiguous slice.
    Slice,
}

fn default_parallelism() -> u32 {
    1
}

fn default_pool() -> String {
    DEFAULT_POOL.to_string()
}

/// Template for one phase of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Max tasks of this step preparing or running at once.
    #[serde(default)]
    pub max_running: Option<u32>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub partition: Partition,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            parallelism: 1,
            max_running: None,
            max_retries: 0,
            resources: ResourceRequest::new(),
            partition: Partition::Replicate,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_max_running(mut self, max_running: u32) -> Self {
        self.max_running = Some(max_running);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn sliced(mut self) -> Self {
        self.partition = Partition::Slice;
        self
    }
}

/// What a client submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default)]
    pub dataset: Option<Dataset>,
    pub steps: Vec<StepSpec>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: default_pool(),
            dataset: None,
            steps: Vec::new(),
        }
    }

    pub fn in_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_dataset(mut self, uri: impl Into<String>, items: u64) -> Self {
        self.dataset = Some(Dataset {
            uri: uri.into(),
            items,
        });
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Structural checks that don't need the pool table.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PlaneError::Validation("job name must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(PlaneError::Validation(format!(
                "job {} has no steps",
                self.name
            )));
        }
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(PlaneError::Validation("step name must not be empty".into()));
            }
            if step.image.trim().is_empty() {
                return Err(PlaneError::Validation(format!(
                    "step {} has no image",
                    step.name
                )));
            }
            if step.parallelism == 0 {
                return Err(PlaneError::Validation(format!(
                    "step {} needs parallelism >= 1",
                    step.name
                )));
            }
            if step.max_running == Some(0) {
                return Err(PlaneError::Validation(format!(
                    "step {} has max_running = 0 and could never run",
                    step.name
                )));
            }
            if step.partition == Partition::Slice && self.dataset.is_none() {
                return Err(PlaneError::Validation(format!(
                    "step {} slices a dataset but job {} has none",
                    step.name, self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub pool: String,
    pub spec: JobSpec,
    /// Ordered; empty until the job is split.
    pub steps: Vec<StepId>,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            pool: spec.pool.clone(),
            spec,
            steps: Vec::new(),
            status: JobStatus::Created,
            failure_reason: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_split(&self) -> bool {
        !self.steps.is_empty()
    }
}
