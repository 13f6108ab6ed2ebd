use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What the propagator does when the calculator proposes a status the
/// parent's state machine doesn't allow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IllegalTransitionPolicy {
    /// Log a warning and keep the current status.
    #[default]
    Suppress,
    /// Fail the update with `PlaneError::IllegalTransition`.
    Reject,
}

impl fmt::Display for IllegalTransitionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IllegalTransitionPolicy::Suppress => write!(f, "suppress"),
            IllegalTransitionPolicy::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for IllegalTransitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "suppress" => Ok(IllegalTransitionPolicy::Suppress),
            "reject" => Ok(IllegalTransitionPolicy::Reject),
            other => Err(format!(
                "unknown illegal-transition policy '{}' (expected suppress or reject)",
                other
            )),
        }
    }
}

/// Options for runs started on the local container engine.
///
/// Runs are sandboxed: capabilities dropped, no new privileges, and
/// optionally no network and a read-only root filesystem.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path or name of the docker CLI
    pub binary: String,
    /// Disable network access in containers
    pub network_disabled: bool,
    /// Mount the root filesystem read-only
    pub read_only: bool,
    /// Number of log lines attached to a terminal report
    pub log_tail: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            network_disabled: false,
            read_only: true,
            log_tail: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub kubectl: String,
    pub namespace: String,
    pub service_account: Option<String>,
    /// How often a run's job object is polled for status
    pub poll_interval_ms: u64,
    pub log_tail: usize,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            namespace: "default".to_string(),
            service_account: None,
            poll_interval_ms: 2000,
            log_tail: 50,
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    pub listen_addr: SocketAddr,
    pub tick_interval_ms: u64,
    /// Wall-clock bound on a single run; `None` disables timeouts.
    pub run_timeout_ms: Option<u64>,
    /// Agents silent for longer than this are reaped.
    pub agent_timeout_ms: u64,
    /// How long terminal jobs stay inspectable before they are archived.
    pub job_retention_secs: u64,
    pub max_jobs: usize,
    pub report_buffer: usize,
    /// Checkpoint directory; in-memory checkpoints when unset.
    pub checkpoint_dir: Option<PathBuf>,
    pub pools_file: Option<PathBuf>,
    pub illegal_transitions: IllegalTransitionPolicy,
    pub enable_docker: bool,
    pub enable_kubernetes: bool,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8420)),
            tick_interval_ms: 500,
            run_timeout_ms: None,
            agent_timeout_ms: 15_000,
            job_retention_secs: 3600,
            max_jobs: 10_000,
            report_buffer: 1024,
            checkpoint_dir: None,
            pools_file: None,
            illegal_transitions: IllegalTransitionPolicy::default(),
            enable_docker: true,
            enable_kubernetes: false,
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl PlaneConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_policy(mut self, policy: IllegalTransitionPolicy) -> Self {
        self.illegal_transitions = policy;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

/// Execution agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Base URL of the controller, e.g. `http://10.0.0.1:8420`
    pub controller_url: String,
    /// Matched against a pool's node selector when placing runs
    pub labels: BTreeMap<String, String>,
    /// Max runs this agent executes at once
    pub capacity: u32,
    pub report_interval_ms: u64,
    pub checkpoint_dir: PathBuf,
    pub docker: DockerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "agent".to_string()),
            controller_url: "http://127.0.0.1:8420".to_string(),
            labels: BTreeMap::new(),
            capacity: 4,
            report_interval_ms: 1000,
            checkpoint_dir: PathBuf::from("/var/lib/mlplane/agent"),
            docker: DockerConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, controller_url: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            controller_url: controller_url.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_config_default() {
        let cfg = DockerConfig::default();
        assert_eq!(cfg.binary, "docker");
        assert!(!cfg.network_disabled);
        assert!(cfg.read_only);
        assert_eq!(cfg.log_tail, 50);
    }

    #[test]
    fn kubernetes_config_default() {
        let cfg = KubernetesConfig::default();
        assert_eq!(cfg.namespace, "default");
        assert!(cfg.service_account.is_none());
        assert_eq!(cfg.poll_interval_ms, 2000);
    }

    #[test]
    fn plane_config_default() {
        let cfg = PlaneConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8420");
        assert!(cfg.run_timeout().is_none());
        assert_eq!(cfg.agent_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.illegal_transitions, IllegalTransitionPolicy::Suppress);
        assert!(cfg.checkpoint_dir.is_none());
        assert!(cfg.enable_docker);
        assert!(!cfg.enable_kubernetes);
    }

    #[test]
    fn plane_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = PlaneConfig::new(addr)
            .with_run_timeout(Duration::from_secs(30))
            .with_policy(IllegalTransitionPolicy::Reject)
            .with_checkpoint_dir("/tmp/ckpt");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.run_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.illegal_transitions, IllegalTransitionPolicy::Reject);
        assert_eq!(cfg.checkpoint_dir, Some(PathBuf::from("/tmp/ckpt")));
    }

    #[test]
    fn agent_config_with_label() {
        let cfg = AgentConfig::new("gpu-box-1", "http://ctl:8420")
            .with_label("accelerator", "a100")
            .with_label("zone", "eu-1");
        assert_eq!(cfg.agent_id, "gpu-box-1");
        assert_eq!(cfg.labels.len(), 2);
        assert_eq!(cfg.labels["accelerator"], "a100");
        assert_eq!(cfg.report_interval(), Duration::from_secs(1));
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!(
            "Reject".parse::<IllegalTransitionPolicy>().unwrap(),
            IllegalTransitionPolicy::Reject
        );
        assert_eq!(
            "suppress".parse::<IllegalTransitionPolicy>().unwrap(),
            IllegalTransitionPolicy::Suppress
        );
        assert!("ignore".parse::<IllegalTransitionPolicy>().is_err());
    }
}
