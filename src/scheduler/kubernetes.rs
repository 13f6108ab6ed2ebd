use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::docker::{LABEL_JOB_ID, LABEL_RUN_ID, LABEL_TASK_ID};
use super::{BackendKind, ExecOutput, ReportReceiver, RunExecutor, RunReport};
use crate::config::KubernetesConfig;
use crate::error::{PlaneError, Result};
use crate::model::{Run, RunId};
use crate::pool::{CPU, GPU, MEMORY_MB};
use crate::status::{Lifecycle, RunStatus};

const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Maps each Run onto a `batch/v1` Job in one namespace, driven through
/// `kubectl`.
#[derive(Debug, Clone)]
pub struct KubernetesExecutor {
    config: KubernetesConfig,
}

impl KubernetesExecutor {
    pub fn new(config: KubernetesConfig) -> Self {
        Self { config }
    }

    /// The Job object that executes `run`. Never retried by the cluster;
    /// retries are a new Run.
    pub fn manifest(&self, run: &Run) -> Value {
        let name = run.container_name();
        let labels = json!({
            "app": "mlplane",
            LABEL_RUN_ID: run.id.to_string(),
            LABEL_TASK_ID: run.task_id.to_string(),
            LABEL_JOB_ID: run.job_id.to_string(),
        });

        let env: Vec<Value> = run
            .spec
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let mut limits = Map::new();
        if let Some(cpu) = run.spec.resources.get(CPU) {
            limits.insert("cpu".into(), json!(cpu.to_string()));
        }
        if let Some(mb) = run.spec.resources.get(MEMORY_MB) {
            limits.insert("memory".into(), json!(format!("{}Mi", mb.ceil() as u64)));
        }
        if let Some(gpu) = run.spec.resources.get(GPU).filter(|g| *g > 0.0) {
            limits.insert(GPU_RESOURCE.into(), json!((gpu.ceil() as u64).to_string()));
        }

        let mut container = json!({
            "name": "run",
            "image": run.spec.image,
            "env": env,
            "resources": { "limits": limits.clone(), "requests": limits },
        });
        if !run.spec.command.is_empty() {
            container["command"] = json!(run.spec.command);
        }

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "nodeSelector": run.spec.node_selector,
            "containers": [container],
        });
        if let Some(account) = &self.config.service_account {
            pod_spec["serviceAccountName"] = json!(account);
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": self.config.namespace,
                "labels": labels,
            },
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": pod_spec,
                }
            }
        })
    }

    async fn kubectl(&self, args: &[String], stdin: Option<String>) -> Result<Output> {
        kubectl(&self.config.kubectl, &self.config.namespace, args, stdin).await
    }

    async fn fetch(&self, name: &str) -> Result<Option<Value>> {
        fetch_job(&self.config.kubectl, &self.config.namespace, name).await
    }

    fn spawn_monitor(&self, run: &Run, reports: ReportReceiver, last: Option<RunStatus>) {
        let config = self.config.clone();
        let name = run.container_name();
        let run_id = run.id;
        tokio::spawn(async move {
            monitor(config, name, run_id, reports, last).await;
        });
    }
}

async fn kubectl(
    binary: &str,
    namespace: &str,
    args: &[String],
    stdin: Option<String>,
) -> Result<Output> {
    let mut child = Command::new(binary)
        .arg("-n")
        .arg(namespace)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PlaneError::Backend(format!("failed to invoke kubectl: {}", e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| PlaneError::Backend(format!("failed to write manifest: {}", e)))?;
    }
    child
        .wait_with_output()
        .await
        .map_err(|e| PlaneError::Backend(format!("kubectl did not complete: {}", e)))
}

async fn fetch_job(binary: &str, namespace: &str, name: &str) -> Result<Option<Value>> {
    let args = [
        "get".to_string(),
        "job".to_string(),
        name.to_string(),
        "-o".to_string(),
        "json".to_string(),
    ];
    let output = kubectl(binary, namespace, &args, None).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        return Err(PlaneError::Backend(format!(
            "kubectl get failed: {}",
            stderr.trim()
        )));
    }
    Ok(Some(serde_json::from_slice(&output.stdout)?))
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}

/// Reads a Job object's status counters.
pub fn status_from_job(job: &Value) -> RunStatus {
    let status = &job["status"];
    let count = |field: &str| status[field].as_u64().unwrap_or(0);
    if count("succeeded") > 0 {
        RunStatus::Success
    } else if count("failed") > 0 {
        RunStatus::Fail
    } else if count("active") > 0 {
        RunStatus::Running
    } else {
        RunStatus::Preparing
    }
}

async fn monitor(
    config: KubernetesConfig,
    name: String,
    run_id: RunId,
    reports: ReportReceiver,
    mut last: Option<RunStatus>,
) {
    let interval = Duration::from_millis(config.poll_interval_ms);
    loop {
        if reports.is_closed() {
            return;
        }
        let observed = match fetch_job(&config.kubectl, &config.namespace, &name).await {
            Ok(Some(job)) => status_from_job(&job),
            Ok(None) => RunStatus::NoSuchContainer,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Polling job failed");
                tokio::time::sleep(interval).await;
                continue;
            }
        };

        if last != Some(observed) {
            let mut report = RunReport::new(run_id, observed);
            if observed.is_terminal() {
                report = report.with_logs(job_logs(&config, &name).await);
                if observed != RunStatus::Success {
                    report = report.with_reason(format!("kubernetes job {} ended {}", name, observed));
                }
            }
            if reports.deliver(report).await.is_err() {
                return;
            }
            last = Some(observed);
        }
        if observed.is_terminal() {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

async fn job_logs(config: &KubernetesConfig, name: &str) -> Vec<String> {
    let args = [
        "logs".to_string(),
        format!("job/{}", name),
        "--tail".to_string(),
        config.log_tail.to_string(),
    ];
    match kubectl(&config.kubectl, &config.namespace, &args, None).await {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl RunExecutor for KubernetesExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    async fn run(&self, run: &Run, reports: ReportReceiver) -> Result<()> {
        let manifest = serde_json::to_string(&self.manifest(run))?;
        tracing::info!(
            run_id = %run.id,
            namespace = %self.config.namespace,
            image = %run.spec.image,
            "Creating kubernetes job"
        );
        let output = self
            .kubectl(&["apply".to_string(), "-f".to_string(), "-".to_string()], Some(manifest))
            .await?;
        if !output.status.success() {
            return Err(PlaneError::Backend(format!(
                "kubectl apply failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        self.spawn_monitor(run, reports, None);
        Ok(())
    }

    async fn attach(&self, run: &Run, reports: ReportReceiver) -> Result<Option<()>> {
        if self.fetch(&run.container_name()).await?.is_none() {
            return Ok(None);
        }
        self.spawn_monitor(run, reports, Some(run.status));
        Ok(Some(()))
    }

    async fn stop(&self, run: &Run) -> Result<Option<()>> {
        let output = self
            .kubectl(
                &[
                    "delete".to_string(),
                    "job".to_string(),
                    run.container_name(),
                    "--wait=false".to_string(),
                ],
                None,
            )
            .await?;
        if output.status.success() {
            return Ok(Some(()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(PlaneError::Backend(format!(
            "kubectl delete failed: {}",
            stderr.trim()
        )))
    }

    async fn remove(&self, run: &Run) -> Result<Option<()>> {
        let output = self
            .kubectl(
                &[
                    "delete".to_string(),
                    "job".to_string(),
                    run.container_name(),
                    "--cascade=foreground".to_string(),
                ],
                None,
            )
            .await?;
        if output.status.success() {
            return Ok(Some(()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(PlaneError::Backend(format!(
            "kubectl delete failed: {}",
            stderr.trim()
        )))
    }

    async fn exec(&self, run: &Run, command: &[String]) -> Result<Option<ExecOutput>> {
        let mut args = vec![
            "exec".to_string(),
            format!("job/{}", run.container_name()),
            "--".to_string(),
        ];
        args.extend(command.iter().cloned());
        let output = self.kubectl(&args, None).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() && is_not_found(&stderr) {
            return Ok(None);
        }
        Ok(Some(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        }))
    }

    async fn probe(&self, run: &Run) -> Result<Option<RunStatus>> {
        Ok(self
            .fetch(&run.container_name())
            .await?
            .map(|job| status_from_job(&job)))
    }
}
