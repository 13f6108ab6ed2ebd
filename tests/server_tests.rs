
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use mlplane::agent::{AgentDirective, AgentReport, NodeTelemetry};
use mlplane::model::JobDetail;
use mlplane::plane::Plane;
use mlplane::pool::ResourcePool;
use mlplane::scheduler::{AgentHub, ExecOutput};
use mlplane::server::{self, CancelResponse, ErrorResponse, JobSummary, SubmitJobResponse};
use mlplane::status::{JobStatus, TaskStatus};

use test_harness::*;

fn api(fake: &Arc<FakeExecutor>) -> (Arc<Plane>, Router) {
    let plane = Arc::new(
        Plane::builder(test_config())
            .backend(fake.clone())
            .agent_hub(Arc::new(AgentHub::new(Duration::from_secs(30))))
            .build(),
    );
    let router = server::router(plane.clone());
    (plane, router)
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

fn job_body() -> Value {
    json!({
        "name": "resnet",
        "steps": [{
            "name": "train",
            "image": "trainer:latest",
            "command": ["python", "train.py"],
            "parallelism": 2
        }]
    })
}

async fn submit(router: &Router) -> Uuid {
    let (status, body) = call(router, Method::POST, "/api/v1/jobs", Some(job_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    parse::<SubmitJobResponse>(&body).job_id
}

#[tokio::test]
async fn test_submit_then_list_and_inspect() {
    let fake = FakeExecutor::new();
    let (_plane, router) = api(&fake);
    let job_id = submit(&router).await;

    let (status, body) = call(&router, Method::GET, "/api/v1/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    let jobs: Vec<JobSummary> = parse(&body);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job_id);
    assert_eq!(jobs[0].name, "resnet");
    assert_eq!(jobs[0].pool, "default");
    assert_eq!(jobs[0].steps, 1);

    let uri = format!("/api/v1/jobs/{}", job_id);
    let (status, body) = call(&router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let detail: JobDetail = parse(&body);
    assert_eq!(detail.job.id, job_id);
    assert_eq!(detail.tasks.len(), 2);
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let fake = FakeExecutor::new();
    let (_plane, router) = api(&fake);
    let uri = format!("/api/v1/jobs/{}", Uuid::new_v4());
    let (status, body) = call(&router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(parse::<ErrorResponse>(&body).error.contains("not found"));

    let uri = format!("/api/v1/jobs/{}/cancel", Uuid::new_v4());
    let (status, _) = call(&router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_submissions_are_400() {
    let fake = FakeExecutor::new();
    let (_plane, router) = api(&fake);

    let mut body = job_body();
    body["pool"] = json!("nowhere");
    let (status, _) = call(&router, Method::POST, "/api/v1/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/v1/jobs",
        Some(json!({"name": "empty", "steps": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!parse::<ErrorResponse>(&body).error.is_empty());

    // malformed bodies are rejected by the extractor
    let (status, _) = call(&router, Method::POST, "/api/v1/jobs", Some(json!({"steps": 3}))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_cancel_job_over_http() {
    let fake = FakeExecutor::new();
    let (plane, router) = api(&fake);
    let job_id = submit(&router).await;
    tick(&plane, 1).await;

    let uri = format!("/api/v1/jobs/{}/cancel", job_id);
    let (status, body) = call(&router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse::<CancelResponse>(&body).canceled);

    tick(&plane, 2).await;
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Canceled);

    let (status, body) = call(&router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!parse::<CancelResponse>(&body).canceled);
}

#[tokio::test]
async fn test_cancel_and_exec_task_over_http() {
    let fake = FakeExecutor::new();
    let (plane, router) = api(&fake);
    let job_id = submit(&router).await;
    tick(&plane, 2).await;
    let tasks = detail(&plane, job_id).await.tasks;
    let (first, second) = (tasks[0].id, tasks[1].id);

    let uri = format!("/api/v1/tasks/{}/exec", first);
    let (status, body) = call(
        &router,
        Method::POST,
        &uri,
        Some(json!({"command": ["nvidia-smi", "-L"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let output: ExecOutput = parse(&body);
    assert_eq!(output.stdout, "nvidia-smi -L");
    assert_eq!(output.exit_code, Some(0));

    let (status, _) = call(&router, Method::POST, &uri, Some(json!({"command": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let uri = format!("/api/v1/tasks/{}/cancel", second);
    let (status, body) = call(&router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse::<CancelResponse>(&body).canceled);
    tick(&plane, 1).await;
    assert_eq!(task(&plane, second).await.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn test_pools_can_be_listed_and_replaced() {
    let fake = FakeExecutor::new();
    let (plane, router) = api(&fake);

    let (status, body) = call(&router, Method::GET, "/api/v1/pools", None).await;
    assert_eq!(status, StatusCode::OK);
    let pools: Vec<ResourcePool> = parse(&body);
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].name, "default");

    let gpu = json!({
        "name": "gpu",
        "backend": "docker",
        "resources": [{"name": "gpu", "min": 1.0, "max": 8.0, "default": 1.0}],
        "max_running": 4
    });
    let (status, body) = call(&router, Method::PUT, "/api/v1/pools/gpu", Some(gpu.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<ResourcePool>(&body).max_running, Some(4));
    assert!(plane.pools().get("gpu").is_some());

    let (status, body) = call(&router, Method::PUT, "/api/v1/pools/cpu", Some(gpu)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(parse::<ErrorResponse>(&body).error.contains("does not match"));

    let broken = json!({
        "name": "broken",
        "resources": [{"name": "gpu", "min": 4.0, "max": 2.0}]
    });
    let (status, _) = call(&router, Method::PUT, "/api/v1/pools/broken", Some(broken)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(plane.pools().get("broken").is_none());
}

#[tokio::test]
async fn test_agent_report_round_trip() {
    let fake = FakeExecutor::new();
    let (_plane, router) = api(&fake);
    let report = AgentReport {
        agent_id: "edge-1".to_string(),
        labels: Default::default(),
        telemetry: NodeTelemetry {
            hostname: "edge-1".to_string(),
            cpus: 4,
            capacity: 2,
            ..Default::default()
        },
        records: vec![],
    };
    let (status, body) = call(
        &router,
        Method::POST,
        "/api/v1/agents/report",
        Some(serde_json::to_value(&report).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let directive: AgentDirective = parse(&body);
    assert!(directive.start.is_empty());
    assert!(directive.cancel.is_empty());

    let (status, body) = call(&router, Method::GET, "/api/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    let agents: Vec<Value> = parse(&body);
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["id"], "edge-1");
}
