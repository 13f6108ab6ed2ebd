//! Backend-agnostic execution.
//!
//! The controller talks to a [`RunExecutor`] per [`BackendKind`]; backends
//! push what they observe back through a [`ReportReceiver`]. Nothing
//! backend-specific crosses this boundary: a backend sees a [`Run`] and
//! answers with [`RunStatus`]es and log lines.

pub mod agent_hub;
pub mod docker;
pub mod kubernetes;
pub mod report;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PlaneError, Result};
use crate::model::Run;
use crate::status::RunStatus;

pub use agent_hub::AgentHub;
pub use docker::DockerExecutor;
pub use kubernetes::KubernetesExecutor;
pub use report::{ReportReceiver, RunReport};

/// Which backend a resource pool dispatches to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Containers on the controller's own container engine.
    #[default]
    Docker,
    /// Jobs in a cluster namespace.
    Kubernetes,
    /// Containers on remote hosts driven through the agent report channel.
    Agent,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Kubernetes => write!(f, "kubernetes"),
            BackendKind::Agent => write!(f, "agent"),
        }
    }
}

/// Output of an ad hoc command run inside a live run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Drives runs on one kind of backend.
///
/// `Ok(None)` from `stop`, `remove`, `exec` and `probe` means the backend has
/// no such run; it is not an error.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start `run` and keep feeding what the backend observes about it into
    /// `reports` until it is terminal.
    async fn run(&self, run: &Run, reports: ReportReceiver) -> Result<()>;

    /// Resume reporting on a run the backend already has, e.g. one started
    /// before a controller restart. Never starts anything.
    async fn attach(&self, run: &Run, reports: ReportReceiver) -> Result<Option<()>>;

    /// Request graceful termination.
    async fn stop(&self, run: &Run) -> Result<Option<()>>;

    /// Release backend resources held by a finished run.
    async fn remove(&self, run: &Run) -> Result<Option<()>>;

    async fn exec(&self, run: &Run, command: &[String]) -> Result<Option<ExecOutput>>;

    /// Current backend view of `run`. Used to adopt runs that were started
    /// before a restart instead of starting them twice.
    async fn probe(&self, run: &Run) -> Result<Option<RunStatus>>;
}

/// The executors available to the controller, one per backend kind.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    executors: HashMap<BackendKind, Arc<dyn RunExecutor>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn RunExecutor>) {
        tracing::info!(backend = %executor.kind(), "Execution backend registered");
        self.executors.insert(executor.kind(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn RunExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn RunExecutor>> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| PlaneError::Backend(format!("no executor registered for {}", kind)))
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.executors.keys().copied().collect()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
