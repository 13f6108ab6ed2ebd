use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use super::{BackendKind, ExecOutput, ReportReceiver, RunExecutor, RunReport};
use crate::config::DockerConfig;
use crate::error::{PlaneError, Result};
use crate::model::Run;
use crate::pool::{CPU, GPU, MEMORY_MB};
use crate::status::RunStatus;

pub const LABEL_RUN_ID: &str = "mlplane.run_id";
pub const LABEL_TASK_ID: &str = "mlplane.task_id";
pub const LABEL_JOB_ID: &str = "mlplane.job_id";

/// Runs each Run as a detached container on the local docker engine.
///
/// Containers are sandboxed:
/// - Dropped capabilities, no new privileges
/// - Read-only root filesystem (configurable)
/// - Optional network isolation
/// - Memory, CPU and GPU limits taken from the run's shaped resource request
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    config: DockerConfig,
}

impl DockerExecutor {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Arguments for `docker run` that start `run` detached.
    pub fn run_args(&self, run: &Run) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            run.container_name(),
            "--label".to_string(),
            format!("{}={}", LABEL_RUN_ID, run.id),
            "--label".to_string(),
            format!("{}={}", LABEL_TASK_ID, run.task_id),
            "--label".to_string(),
            format!("{}={}", LABEL_JOB_ID, run.job_id),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        let resources = &run.spec.resources;
        if let Some(mb) = resources.get(MEMORY_MB) {
            args.push(format!("--memory={}m", mb.ceil() as u64));
        }
        if let Some(cpus) = resources.get(CPU) {
            args.push(format!("--cpus={}", cpus));
        }
        if let Some(gpus) = resources.get(GPU).filter(|g| *g > 0.0) {
            args.push(format!("--gpus={}", gpus.ceil() as u64));
        }

        for (key, value) in &run.spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        if self.config.read_only {
            args.push("--read-only".to_string());
        }

        args.push(run.spec.image.clone());
        args.extend(run.spec.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        Command::new(&self.config.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PlaneError::Backend(format!("failed to invoke docker: {}", e)))
    }

    fn spawn_monitor(&self, run: &Run, reports: ReportReceiver) {
        let binary = self.config.binary.clone();
        let log_tail = self.config.log_tail;
        let name = run.container_name();
        let run_id = run.id;
        tokio::spawn(async move {
            let report = wait_for_exit(&binary, &name, log_tail, run_id).await;
            tracing::info!(
                run_id = %run_id,
                status = %report.status,
                exit_code = ?report.exit_code,
                "Container finished"
            );
            if let Err(e) = reports.deliver(report).await {
                tracing::warn!(run_id = %run_id, error = %e, "Could not deliver run report");
            }
        });
    }
}

async fn wait_for_exit(binary: &str, name: &str, log_tail: usize, run_id: uuid::Uuid) -> RunReport {
    let waited = Command::new(binary)
        .args(["wait", name])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match waited {
        Ok(output) => output,
        Err(e) => {
            return RunReport::new(run_id, RunStatus::Fail)
                .with_reason(format!("docker wait failed: {}", e));
        }
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            return RunReport::new(run_id, RunStatus::NoSuchContainer)
                .with_reason("container disappeared");
        }
        return RunReport::new(run_id, RunStatus::Fail).with_reason(stderr.trim().to_string());
    }

    let exit_code = String::from_utf8_lossy(&output.stdout).trim().parse::<i32>().ok();
    let logs = tail_logs(binary, name, log_tail).await;
    match exit_code {
        Some(0) => RunReport::new(run_id, RunStatus::Success)
            .with_exit_code(Some(0))
            .with_logs(logs),
        code => RunReport::new(run_id, RunStatus::Fail)
            .with_exit_code(code)
            .with_reason(format!("container exited with code {:?}", code))
            .with_logs(logs),
    }
}

async fn tail_logs(binary: &str, name: &str, lines: usize) -> Vec<String> {
    let output = Command::new(binary)
        .args(["logs", "--tail", &lines.to_string(), name])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;
    match output {
        Ok(output) => {
            // docker logs replays the container's stderr on our stderr
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            text.lines().map(str::to_string).collect()
        }
        Err(_) => Vec::new(),
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// Maps `docker inspect` state onto the run vocabulary.
pub fn map_state(state: &str, exit_code: Option<i32>) -> RunStatus {
    match state {
        "created" => RunStatus::Created,
        "running" => RunStatus::Running,
        "paused" => RunStatus::Paused,
        "restarting" => RunStatus::Restarting,
        "removing" => RunStatus::Removing,
        "dead" => RunStatus::Dead,
        "exited" if exit_code == Some(0) => RunStatus::Success,
        _ => RunStatus::Fail,
    }
}

#[async_trait]
impl RunExecutor for DockerExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn run(&self, run: &Run, reports: ReportReceiver) -> Result<()> {
        tracing::info!(run_id = %run.id, image = %run.spec.image, "Starting container");
        let output = self.docker(&self.run_args(run)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("is already in use") {
                // started by an earlier attempt at this launch
                self.spawn_monitor(run, reports);
                return Ok(());
            }
            return Err(PlaneError::Backend(format!(
                "docker run failed: {}",
                stderr.trim()
            )));
        }
        reports
            .deliver(RunReport::new(run.id, RunStatus::Running))
            .await?;
        self.spawn_monitor(run, reports);
        Ok(())
    }

    async fn attach(&self, run: &Run, reports: ReportReceiver) -> Result<Option<()>> {
        if self.probe(run).await?.is_none() {
            return Ok(None);
        }
        self.spawn_monitor(run, reports);
        Ok(Some(()))
    }

    async fn stop(&self, run: &Run) -> Result<Option<()>> {
        let output = self
            .docker(&["stop".to_string(), run.container_name()])
            .await?;
        if output.status.success() {
            return Ok(Some(()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            return Ok(None);
        }
        Err(PlaneError::Backend(format!(
            "docker stop failed: {}",
            stderr.trim()
        )))
    }

    async fn remove(&self, run: &Run) -> Result<Option<()>> {
        let output = self
            .docker(&["rm".to_string(), "-f".to_string(), run.container_name()])
            .await?;
        if output.status.success() {
            return Ok(Some(()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            return Ok(None);
        }
        Err(PlaneError::Backend(format!("docker rm failed: {}", stderr.trim())))
    }

    async fn exec(&self, run: &Run, command: &[String]) -> Result<Option<ExecOutput>> {
        let mut args = vec!["exec".to_string(), run.container_name()];
        args.extend(command.iter().cloned());
        let output = self.docker(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() && is_missing(&stderr) {
            return Ok(None);
        }
        Ok(Some(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        }))
    }

    async fn probe(&self, run: &Run) -> Result<Option<RunStatus>> {
        let output = self
            .docker(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}} {{.State.ExitCode}}".to_string(),
                run.container_name(),
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(PlaneError::Backend(format!(
                "docker inspect failed: {}",
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut fields = stdout.split_whitespace();
        let state = fields.next().unwrap_or_default();
        let exit_code = fields.next().and_then(|c| c.parse().ok());
        Ok(Some(map_state(state, exit_code)))
    }
}
