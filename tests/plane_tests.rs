
use std::sync::Arc;
use std::time::Duration;

use mlplane::model::{JobSpec, StepSpec};
use mlplane::pipeline::MemoryCheckpointStore;
use mlplane::plane::Plane;
use mlplane::pool::{PoolRegistry, ResourceBound, ResourcePool, ResourceRequest, CPU};
use mlplane::scheduler::{BackendKind, RunReport};
use mlplane::status::{JobStatus, RunStatus, StepStatus, TaskStatus};

use test_harness::*;

#[tokio::test]
async fn test_single_step_job_runs_to_success() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());

    let job_id = plane.submit_job(single_step_job("mnist", 1)).await.unwrap();
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Split);

    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 1);
    let task = only_task(&plane, job_id).await;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Running);

    let run_id = fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;

    let detail = detail(&plane, job_id).await;
    assert_eq!(detail.job.status, JobStatus::Success);
    assert!(detail.job.finished_at.is_some());
    assert_eq!(detail.steps[0].status, StepStatus::Success);
    assert_eq!(detail.runs[0].status, RunStatus::Success);
    assert!(!in_task_pipeline(&plane, task.id).await);
    assert!(fake.removed().contains(&run_id));
}

#[tokio::test]
async fn test_run_carries_task_environment() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let spec = JobSpec::new("sliced").with_dataset("s3://bucket/images", 100).step(
        StepSpec::new("embed", "embedder:1")
            .with_parallelism(4)
            .with_env("BATCH", "32")
            .sliced(),
    );
    plane.submit_job(spec).await.unwrap();

    tick(&plane, 1).await;

    let runs = fake.started();
    assert_eq!(runs.len(), 4);
    let mut offsets: Vec<String> = runs
        .iter()
        .map(|r| r.spec.env["MLPLANE_SLICE_OFFSET"].clone())
        .collect();
    offsets.sort_by_key(|o| o.parse::<u64>().unwrap());
    assert_eq!(offsets, vec!["0", "25", "50", "75"]);
    assert!(runs.iter().all(|r| r.spec.env["BATCH"] == "32"));
    assert!(runs.iter().all(|r| r.spec.backend == BackendKind::Docker));
}

#[tokio::test]
async fn test_steps_run_in_order() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(two_step_job("pipeline")).await.unwrap();

    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 1);
    assert_eq!(fake.started()[0].spec.image, "prep:latest");

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;

    // the first step's success triggers the second within the same tick
    assert_eq!(fake.start_count(), 2);
    assert_eq!(fake.started()[1].spec.image, "trainer:latest");
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Running);

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Success);
}

#[tokio::test]
async fn test_failure_cancels_downstream_steps() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(two_step_job("pipeline")).await.unwrap();

    tick(&plane, 1).await;
    let run_id = fake.started()[0].id;
    fake.send(RunReport::new(run_id, RunStatus::Fail).with_exit_code(Some(3)))
        .await;
    tick(&plane, 1).await;

    let detail = detail(&plane, job_id).await;
    assert_eq!(detail.job.status, JobStatus::Fail);
    assert_eq!(detail.steps[0].status, StepStatus::Fail);
    assert_eq!(detail.steps[1].status, StepStatus::Canceled);
    let reason = detail.job.failure_reason.unwrap();
    assert!(reason.starts_with("task 0 of step prepare failed"), "{}", reason);
    assert!(reason.contains("exited with code 3"), "{}", reason);

    tick(&plane, 2).await;
    assert_eq!(fake.start_count(), 1);
}

#[tokio::test]
async fn test_failed_attempt_is_retried() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let spec = JobSpec::new("flaky").step(StepSpec::new("train", "trainer:latest").with_retries(1));
    let job_id = plane.submit_job(spec).await.unwrap();

    tick(&plane, 1).await;
    let first = fake.report_last(RunStatus::Fail).await;
    // relaunch, then launch
    tick(&plane, 2).await;

    let runs = fake.started();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].attempt, 2);
    assert_ne!(runs[1].id, first);
    let task = only_task(&plane, job_id).await;
    assert_eq!(task.attempt, 2);
    assert_eq!(task.retries, 1);
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Running);

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;

    let detail = detail(&plane, job_id).await;
    assert_eq!(detail.job.status, JobStatus::Success);
    assert_eq!(detail.runs.len(), 2);
    assert_eq!(detail.runs[0].status, RunStatus::Fail);
    assert_eq!(detail.runs[1].status, RunStatus::Success);
}

#[tokio::test]
async fn test_report_for_superseded_attempt_is_ignored() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let spec = JobSpec::new("flaky").step(StepSpec::new("train", "trainer:latest").with_retries(1));
    let job_id = plane.submit_job(spec).await.unwrap();

    tick(&plane, 1).await;
    let first = fake.report_last(RunStatus::Fail).await;
    tick(&plane, 2).await;

    // a late success for the old attempt changes nothing
    plane
        .apply_report(RunReport::new(first, RunStatus::Success))
        .await
        .unwrap();
    let task = only_task(&plane, job_id).await;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 2);
}

#[tokio::test]
async fn test_duplicate_reports_are_idempotent() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(single_step_job("dup", 1)).await.unwrap();
    tick(&plane, 1).await;

    let run_id = fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    let propagation = plane
        .apply_report(RunReport::new(run_id, RunStatus::Success))
        .await
        .unwrap();
    assert!(propagation.is_empty());

    // a stale RUNNING after SUCCESS doesn't reopen anything
    plane
        .apply_report(RunReport::new(run_id, RunStatus::Running))
        .await
        .unwrap();
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Success);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(single_step_job("long", 2)).await.unwrap();
    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 2);

    assert!(plane.cancel_job(job_id).await.unwrap());
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Canceled);

    tick(&plane, 1).await;

    let detail = detail(&plane, job_id).await;
    assert!(detail.tasks.iter().all(|t| t.status == TaskStatus::Canceled));
    assert!(detail.runs.iter().all(|r| r.status == RunStatus::Canceled));
    assert_eq!(detail.steps[0].status, StepStatus::Canceled);
    assert_eq!(fake.stopped().len(), 2);
    for task in &detail.tasks {
        assert!(!in_task_pipeline(&plane, task.id).await);
    }
    assert!(plane.context().cancellations.is_empty());

    assert!(!plane.cancel_job(job_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_job_before_first_tick() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(two_step_job("early")).await.unwrap();

    assert!(plane.cancel_job(job_id).await.unwrap());
    tick(&plane, 2).await;

    let detail = detail(&plane, job_id).await;
    assert_eq!(detail.job.status, JobStatus::Canceled);
    assert!(detail
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Canceled));
    assert!(detail.tasks.iter().all(|t| t.status == TaskStatus::Canceled));
    assert_eq!(fake.start_count(), 0);
    assert!(plane.step_pipeline().lists().lock().await.is_empty());
    assert!(plane.task_pipeline().lists().lock().await.is_empty());
}

#[tokio::test]
async fn test_cancel_single_task() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(single_step_job("pair", 2)).await.unwrap();
    tick(&plane, 1).await;

    let tasks = detail(&plane, job_id).await.tasks;
    assert!(plane.cancel_task(tasks[0].id).await.unwrap());
    tick(&plane, 1).await;
    assert_eq!(task(&plane, tasks[0].id).await.status, TaskStatus::Canceled);
    assert_eq!(task(&plane, tasks[1].id).await.status, TaskStatus::Running);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Running);

    let run = fake
        .started()
        .into_iter()
        .find(|r| r.task_id == tasks[1].id)
        .unwrap();
    fake.report(run.id, RunStatus::Success).await;
    tick(&plane, 1).await;

    // one success, one cancellation
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Canceled);
    assert!(!plane.cancel_task(tasks[1].id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_task_never_admitted_is_immediate() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(single_step_job("solo", 1)).await.unwrap();
    let task_id = only_task(&plane, job_id).await.id;

    assert!(plane.cancel_task(task_id).await.unwrap());
    assert_eq!(task(&plane, task_id).await.status, TaskStatus::Canceled);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Canceled);

    tick(&plane, 2).await;
    assert_eq!(fake.start_count(), 0);
}

#[tokio::test]
async fn test_run_timeout_fails_task() {
    let fake = FakeExecutor::new();
    let config = test_config().with_run_timeout(Duration::from_millis(50));
    let plane = Plane::builder(config).backend(fake.clone()).build();
    let job_id = plane.submit_job(single_step_job("slow", 1)).await.unwrap();
    tick(&plane, 1).await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    let summary = plane.tick().await.unwrap();
    assert_eq!(summary.timed_out, 1);

    let task = only_task(&plane, job_id).await;
    assert_eq!(task.status, TaskStatus::Fail);
    assert_eq!(
        task.failure_reason.as_deref(),
        Some("run exceeded timeout of 0s")
    );
    assert_eq!(fake.stopped().len(), 1);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Fail);
}

#[tokio::test]
async fn test_step_max_running_bounds_launches() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let spec = JobSpec::new("bounded").step(
        StepSpec::new("eval", "eval:latest")
            .with_parallelism(3)
            .with_max_running(1),
    );
    let job_id = plane.submit_job(spec).await.unwrap();

    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 1);
    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 1);

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 2);

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 3);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Success);
}

#[tokio::test]
async fn test_pool_max_running_is_shared_across_jobs() {
    let fake = FakeExecutor::new();
    let pools = PoolRegistry::from_pools(vec![
        ResourcePool::new("gpu", BackendKind::Docker).with_max_running(1)
    ])
    .unwrap();
    let plane = Plane::builder(test_config())
        .pools(Arc::new(pools))
        .backend(fake.clone())
        .build();
    let first = plane
        .submit_job(single_step_job("a", 1).in_pool("gpu"))
        .await
        .unwrap();
    let second = plane
        .submit_job(single_step_job("b", 1).in_pool("gpu"))
        .await
        .unwrap();

    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 1);

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    assert_eq!(fake.start_count(), 2);

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    assert_eq!(job_status(&plane, first).await, JobStatus::Success);
    assert_eq!(job_status(&plane, second).await, JobStatus::Success);
}

#[tokio::test]
async fn test_submit_rejects_invalid_resources() {
    let fake = FakeExecutor::new();
    let pools = PoolRegistry::from_pools(vec![ResourcePool::new("batch", BackendKind::Docker)
        .with_resource(ResourceBound::new(CPU, 1.0, 8.0, 2.0))])
    .unwrap();
    let plane = Plane::builder(test_config())
        .pools(Arc::new(pools))
        .backend(fake.clone())
        .build();

    let spec = JobSpec::new("greedy").in_pool("batch").step(
        StepSpec::new("s", "img").with_resources(ResourceRequest::new().with(CPU, 64.0)),
    );
    let err = plane.submit_job(spec).await.unwrap_err();
    assert!(err.is_validation());

    let err = plane
        .submit_job(single_step_job("lost", 1).in_pool("nowhere"))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(plane.list_jobs().await.is_empty());
}

#[tokio::test]
async fn test_pool_tightened_after_submit_fails_task_at_launch() {
    let fake = FakeExecutor::new();
    let pools = Arc::new(
        PoolRegistry::from_pools(vec![ResourcePool::new("batch", BackendKind::Docker)
            .with_resource(ResourceBound::new(CPU, 1.0, 8.0, 2.0))])
        .unwrap(),
    );
    let plane = Plane::builder(test_config())
        .pools(pools.clone())
        .backend(fake.clone())
        .build();
    let spec = JobSpec::new("j").in_pool("batch").step(
        StepSpec::new("s", "img").with_resources(ResourceRequest::new().with(CPU, 4.0)),
    );
    let job_id = plane.submit_job(spec).await.unwrap();

    pools
        .upsert(
            ResourcePool::new("batch", BackendKind::Docker)
                .with_resource(ResourceBound::new(CPU, 1.0, 2.0, 1.0)),
        )
        .unwrap();
    tick(&plane, 1).await;

    let task = only_task(&plane, job_id).await;
    assert_eq!(task.status, TaskStatus::Fail);
    assert!(task.failure_reason.unwrap().contains("exceeds max"));
    assert_eq!(fake.start_count(), 0);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Fail);
}

#[tokio::test]
async fn test_backend_refusal_counts_against_retries() {
    let fake = FakeExecutor::new();
    fake.fail_next_starts(1);
    let plane = plane_with(fake.clone());
    let spec = JobSpec::new("j").step(StepSpec::new("s", "img").with_retries(1));
    let job_id = plane.submit_job(spec).await.unwrap();

    let summary = plane.tick().await.unwrap();
    assert_eq!(summary.tasks.failed, 1);
    assert_eq!(fake.start_count(), 0);
    assert_eq!(only_task(&plane, job_id).await.attempt, 2);

    tick(&plane, 2).await;
    assert_eq!(fake.start_count(), 1);
    assert_eq!(fake.started()[0].attempt, 2);
}

#[tokio::test]
async fn test_backend_refusal_without_retries_fails_job() {
    let fake = FakeExecutor::new();
    fake.fail_next_starts(1);
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(single_step_job("j", 1)).await.unwrap();

    tick(&plane, 2).await;

    let task = only_task(&plane, job_id).await;
    assert_eq!(task.status, TaskStatus::Fail);
    assert!(task.failure_reason.unwrap().starts_with("launch failed"));
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Fail);
    assert!(!in_task_pipeline(&plane, task.id).await);
}

#[tokio::test]
async fn test_any_launch_error_counts_against_retries() {
    let fake = FakeExecutor::new();
    fake.break_next_starts(2);
    let plane = plane_with(fake.clone());
    let spec = JobSpec::new("j").step(StepSpec::new("s", "img").with_retries(1));
    let job_id = plane.submit_job(spec).await.unwrap();

    let summary = plane.tick().await.unwrap();
    assert_eq!(summary.tasks.failed, 1);
    assert_eq!(only_task(&plane, job_id).await.attempt, 2);

    tick(&plane, 3).await;
    let task = only_task(&plane, job_id).await;
    assert_eq!(task.status, TaskStatus::Fail);
    assert_eq!(task.attempt, 2);
    assert!(task.failure_reason.unwrap().contains("start handler crashed"));
    assert_eq!(fake.start_count(), 0);
    assert_eq!(job_status(&plane, job_id).await, JobStatus::Fail);
}

#[tokio::test]
async fn test_exec_into_running_task() {
    let fake = FakeExecutor::new();
    let plane = plane_with(fake.clone());
    let job_id = plane.submit_job(single_step_job("j", 1)).await.unwrap();
    let task_id = only_task(&plane, job_id).await.id;

    let err = plane.exec(task_id, &["ls".to_string()]).await.unwrap_err();
    assert!(err.is_validation());

    tick(&plane, 1).await;
    let output = plane
        .exec(task_id, &["nvidia-smi".to_string(), "-L".to_string()])
        .await
        .unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.stdout, "nvidia-smi -L");

    assert!(plane.exec(task_id, &[]).await.unwrap_err().is_validation());

    fake.report_last(RunStatus::Success).await;
    tick(&plane, 1).await;
    let err = plane.exec(task_id, &["ls".to_string()]).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_finished_jobs_are_archived_after_retention() {
    let fake = FakeExecutor::new();
    let mut config = test_config();
    config.job_retention_secs = 0;
    let plane = Plane::builder(config).backend(fake.clone()).build();
    let job_id = plane.submit_job(single_step_job("j", 1)).await.unwrap();
    let running = plane.submit_job(single_step_job("k", 1)).await.unwrap();

    tick(&plane, 1).await;
    let run = fake.started()[0].clone();
    fake.report(run.id, RunStatus::Success).await;
    let summary = plane.tick().await.unwrap();

    assert_eq!(summary.archived, 1);
    let finished = if run.job_id == job_id { job_id } else { running };
    let unfinished = if finished == job_id { running } else { job_id };
    assert!(plane.job_detail(finished).await.unwrap_err().is_not_found());
    assert_eq!(
        job_status(&plane, unfinished).await,
        JobStatus::Running
    );
}

#[tokio::test]
async fn test_restart_reattaches_launched_runs() {
    let fake = FakeExecutor::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = Plane::builder(test_config())
        .checkpoints(store.clone())
        .backend(fake.clone())
        .build();
    let job_id = first.submit_job(single_step_job("j", 1)).await.unwrap();
    tick(&first, 1).await;
    let run_id = fake.started()[0].id;

    let second = Plane::builder(test_config())
        .units(first.units())
        .checkpoints(store.clone())
        .backend(fake.clone())
        .build();
    drop(first);
    assert_eq!(second.recover().await.unwrap(), 2);
    assert_eq!(fake.attached(), vec![run_id]);

    fake.report(run_id, RunStatus::Success).await;
    tick(&second, 1).await;
    assert_eq!(job_status(&second, job_id).await, JobStatus::Success);
    assert_eq!(fake.start_count(), 1);
}

#[tokio::test]
async fn test_restart_fails_runs_lost_while_down() {
    let fake = FakeExecutor::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = Plane::builder(test_config())
        .checkpoints(store.clone())
        .backend(fake.clone())
        .build();
    let job_id = first.submit_job(single_step_job("j", 1)).await.unwrap();
    tick(&first, 1).await;
    fake.lose(fake.started()[0].id);

    let second = Plane::builder(test_config())
        .units(first.units())
        .checkpoints(store)
        .backend(fake.clone())
        .build();
    second.recover().await.unwrap();

    let task = only_task(&second, job_id).await;
    assert_eq!(task.status, TaskStatus::Fail);
    assert_eq!(
        task.failure_reason.as_deref(),
        Some("run lost while the controller was down")
    );
    assert_eq!(job_status(&second, job_id).await, JobStatus::Fail);
}

#[tokio::test]
async fn test_crash_between_launch_and_checkpoint_does_not_start_twice() {
    let fake = FakeExecutor::new();
    let store = FlakyStore::new();
    store.fail_post_of("launch_task");
    let first = Plane::builder(test_config())
        .checkpoints(store.clone())
        .backend(fake.clone())
        .build();
    let job_id = first.submit_job(single_step_job("j", 1)).await.unwrap();

    let err = first.tick().await.unwrap_err();
    assert!(err.is_infrastructure());
    assert_eq!(fake.start_count(), 1);
    let run_id = fake.started()[0].id;

    store.heal();
    let second = Plane::builder(test_config())
        .units(first.units())
        .checkpoints(store.clone())
        .backend(fake.clone())
        .build();
    drop(first);
    second.recover().await.unwrap();
    tick(&second, 1).await;

    // the planned run id survived in the pre checkpoint and was adopted
    assert_eq!(fake.start_count(), 1);
    assert_eq!(fake.attached(), vec![run_id]);
    let lists = second.task_pipeline().lists();
    let task_id = only_task(&second, job_id).await.id;
    assert_eq!(lists.lock().await.locate(&task_id), Some("launched"));

    fake.report(run_id, RunStatus::Success).await;
    tick(&second, 1).await;
    assert_eq!(job_status(&second, job_id).await, JobStatus::Success);
}

#[tokio::test]
async fn test_run_loop_drives_job_until_shutdown() {
    let fake = FakeExecutor::new();
    let plane = Arc::new(plane_with(fake.clone()));
    let job_id = plane.submit_job(single_step_job("looped", 1)).await.unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = {
        let plane = plane.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { plane.run(shutdown).await })
    };

    let started = wait_for(
        || {
            let fake = fake.clone();
            async move { fake.start_count() == 1 }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(started, "run was never started");
    fake.report_last(RunStatus::Success).await;

    let finished = wait_for(
        || {
            let plane = plane.clone();
            async move { job_status(&plane, job_id).await == JobStatus::Success }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(finished, "job did not finish");

    shutdown.cancel();
    handle.await.unwrap();
}
