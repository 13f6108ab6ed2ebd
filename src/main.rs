use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use mlplane::agent::Agent;
use mlplane::config::{AgentConfig, IllegalTransitionPolicy, PlaneConfig};
use mlplane::model::{JobDetail, JobSpec};
use mlplane::plane::Plane;
use mlplane::server::{self, CancelResponse, ErrorResponse, JobSummary, SubmitJobResponse};
use mlplane::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "mlplane")]
#[command(version)]
#[command(about = "A control plane for ML jobs on container backends")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the controller
    Server(ServerArgs),

    /// Start an execution agent on this host
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Task management commands
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address the HTTP API listens on
    #[arg(long, default_value = "127.0.0.1:8420")]
    listen: SocketAddr,

    /// Controller tick interval in milliseconds
    #[arg(long, default_value = "500")]
    tick_ms: u64,

    /// Fail runs that take longer than this many seconds
    #[arg(long)]
    run_timeout_secs: Option<u64>,

    /// Reap agents silent for this many seconds
    #[arg(long, default_value = "15")]
    agent_timeout_secs: u64,

    /// Keep finished jobs inspectable for this many seconds
    #[arg(long, default_value = "3600")]
    retention_secs: u64,

    /// Directory for pipeline checkpoints (in-memory when omitted)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// JSON file with resource pool definitions
    #[arg(long)]
    pools_file: Option<PathBuf>,

    /// What to do with illegal calculated transitions: suppress or reject
    #[arg(long, default_value = "suppress")]
    illegal_transitions: IllegalTransitionPolicy,

    /// Don't run containers on the controller's own docker engine
    #[arg(long)]
    no_docker: bool,

    /// Enable the Kubernetes backend (uses kubectl)
    #[arg(long)]
    kubernetes: bool,

    /// Namespace for Kubernetes runs
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Disable network access in docker runs
    #[arg(long)]
    docker_network_disabled: bool,
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Agent ID (defaults to the hostname)
    #[arg(long)]
    id: Option<String>,

    /// Controller base URL
    #[arg(long, default_value = "http://127.0.0.1:8420")]
    controller: String,

    /// Node label matched against pool selectors, as key=value (repeatable)
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Max runs executed at once
    #[arg(long, default_value = "4")]
    capacity: u32,

    /// Report interval in milliseconds
    #[arg(long, default_value = "1000")]
    report_ms: u64,

    /// Directory for the agent's checkpoints
    #[arg(long, default_value = "/var/lib/mlplane/agent")]
    checkpoint_dir: PathBuf,

    /// Disable network access in docker runs
    #[arg(long)]
    docker_network_disabled: bool,
}

// =============================================================================
// Client Arguments (shared by job and task commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Controller base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8420")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job from a JSON spec file
    Submit {
        /// Path to the job spec
        file: PathBuf,
    },
    /// Show a job with its steps, tasks and runs
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List all jobs
    List,
    /// Cancel a job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Cancel a single task
    Cancel {
        /// The task ID (UUID)
        task_id: String,
    },
}

#[derive(Serialize)]
struct TaskLine {
    task_id: String,
    step: String,
    index: u32,
    attempt: u32,
    status: String,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("invalid label '{}', expected key=value", s)),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server and Agent
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = PlaneConfig::new(args.listen);
    config.tick_interval_ms = args.tick_ms;
    config.run_timeout_ms = args.run_timeout_secs.map(|s| s * 1000);
    config.agent_timeout_ms = args.agent_timeout_secs * 1000;
    config.job_retention_secs = args.retention_secs;
    config.checkpoint_dir = args.checkpoint_dir;
    config.pools_file = args.pools_file;
    config.illegal_transitions = args.illegal_transitions;
    config.enable_docker = !args.no_docker;
    config.enable_kubernetes = args.kubernetes;
    config.kubernetes.namespace = args.namespace;
    config.docker.network_disabled = args.docker_network_disabled;

    tracing::info!(
        listen_addr = %config.listen_addr,
        checkpoint_dir = ?config.checkpoint_dir,
        pools_file = ?config.pools_file,
        docker = config.enable_docker,
        kubernetes = config.enable_kubernetes,
        policy = %config.illegal_transitions,
        "Starting mlplane controller"
    );

    let plane = Arc::new(Plane::from_config(config.clone()).await?);
    let restored = plane.recover().await?;
    tracing::info!(restored, "Pipelines recovered");

    let shutdown = install_shutdown_handler("controller")?;
    let controller = {
        let plane = plane.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { plane.run(token).await })
    };

    let served = server::run_server(config.listen_addr, plane, shutdown.clone()).await;
    shutdown.cancel();
    controller.await?;
    served?;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = AgentConfig {
        controller_url: args.controller,
        capacity: args.capacity,
        report_interval_ms: args.report_ms,
        checkpoint_dir: args.checkpoint_dir,
        ..AgentConfig::default()
    };
    if let Some(id) = args.id {
        config.agent_id = id;
    }
    config.labels.extend(args.labels);
    config.docker.network_disabled = args.docker_network_disabled;

    tracing::info!(
        agent_id = %config.agent_id,
        controller = %config.controller_url,
        capacity = config.capacity,
        labels = ?config.labels,
        "Starting mlplane agent"
    );

    let agent = Agent::open(config).await?;
    let restored = agent.recover().await?;
    tracing::info!(restored, "Agent state recovered");

    let shutdown = install_shutdown_handler("agent")?;
    agent.run(shutdown).await;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn read_answer<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    if response.status().is_success() {
        return Ok(response.json::<T>().await?);
    }
    let status = response.status();
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

async fn handle_job_submit(
    client: &reqwest::Client,
    args: &ClientArgs,
    file: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(&file).await?;
    let spec: JobSpec = serde_json::from_str(&raw)?;
    let response = client
        .post(format!("{}/api/v1/jobs", args.addr))
        .json(&spec)
        .send()
        .await?;
    let answer: SubmitJobResponse = read_answer(response).await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&answer)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", answer.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &reqwest::Client,
    args: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/v1/jobs/{}", args.addr, job_id))
        .send()
        .await?;
    let detail: JobDetail = read_answer(response).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&detail)?),
        OutputFormat::Table => {
            println!("Job ID:   {}", detail.job.id);
            println!("Name:     {}", detail.job.name);
            println!("Pool:     {}", detail.job.pool);
            println!("Status:   {}", detail.job.status);
            if let Some(reason) = &detail.job.failure_reason {
                println!("Failure:  {}", reason);
            }
            println!();
            let lines: Vec<TaskLine> = detail
                .tasks
                .iter()
                .map(|t| TaskLine {
                    task_id: t.id.to_string(),
                    step: detail
                        .steps
                        .iter()
                        .find(|s| s.id == t.step_id)
                        .map(|s| s.name.clone())
                        .unwrap_or_default(),
                    index: t.index,
                    attempt: t.attempt,
                    status: t.status.to_string(),
                })
                .collect();
            println!(
                "{:<38} {:<16} {:<6} {:<8} STATUS",
                "TASK ID", "STEP", "INDEX", "ATTEMPT"
            );
            println!("{}", "-".repeat(80));
            for line in &lines {
                println!(
                    "{:<38} {:<16} {:<6} {:<8} {}",
                    line.task_id, line.step, line.index, line.attempt, line.status
                );
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/v1/jobs", args.addr))
        .send()
        .await?;
    let jobs: Vec<JobSummary> = read_answer(response).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<12} {:<12} NAME", "JOB ID", "STATUS", "POOL");
            println!("{}", "-".repeat(78));
            for job in &jobs {
                let name = if job.name.len() > 20 {
                    format!("{}...", &job.name[..17])
                } else {
                    job.name.clone()
                };
                println!("{:<38} {:<12} {:<12} {}", job.id, job.status, job.pool, name);
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_cancel(
    client: &reqwest::Client,
    args: &ClientArgs,
    kind: &str,
    id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/v1/{}s/{}/cancel", args.addr, kind, id))
        .send()
        .await?;
    let answer: CancelResponse = read_answer(response).await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&answer)?),
        OutputFormat::Table if answer.canceled => println!("{} {} canceled", kind, id),
        OutputFormat::Table => println!("{} {} had already finished", kind, id),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            match command {
                JobCommands::Submit { file } => handle_job_submit(&http, &client, file).await?,
                JobCommands::Status { job_id } => handle_job_status(&http, &client, job_id).await?,
                JobCommands::List => handle_job_list(&http, &client).await?,
                JobCommands::Cancel { job_id } => {
                    handle_cancel(&http, &client, "job", job_id).await?
                }
            }
        }
        Commands::Task { client, command } => {
            let http = reqwest::Client::new();
            match command {
                TaskCommands::Cancel { task_id } => {
                    handle_cancel(&http, &client, "task", task_id).await?
                }
            }
        }
    }

    Ok(())
}
