#![allow(clippy::disallowed_methods)]

mod common;

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use job_core::{Job, JobResult, JobStatus, ProcessId, ResourceRef};
use serde_json::json;
use std::error::Error;

use db::{DbError, repositories::JobFilter};

#[tokio::test]
async fn job_lifecycle_only_moves_forward() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");

    let job = store
        .jobs
        .submit("echo", json!({"msg": "hi"}), Some(ResourceRef::new("vm", "1")))
        .await?;
    let loaded = store.jobs.get(job.job_id).await?;
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.payload, json!({"msg": "hi"}));
    assert_eq!(loaded.resource, Some(ResourceRef::new("vm", "1")));

    // Nothing but a claim leaves QUEUED.
    let early = store
        .jobs
        .complete(job.job_id, JobStatus::Succeeded, &JobResult::new("done"), &owner)
        .await;
    assert!(matches!(early, Err(DbError::InvalidTransition(_))));
    let early_step = store.jobs.update_step(job.job_id, "copy").await;
    assert!(matches!(early_step, Err(DbError::InvalidTransition(_))));

    assert!(store.jobs.mark_running(job.job_id, &owner).await?);
    assert!(!store.jobs.mark_running(job.job_id, &owner).await?);

    store.jobs.update_step(job.job_id, "copy").await?;
    store.jobs.update_step(job.job_id, "verify").await?;
    let running = store.jobs.get(job.job_id).await?;
    assert_eq!(running.status, JobStatus::InProgress);
    assert_eq!(running.owner, Some(owner.clone()));
    assert_eq!(running.step.as_deref(), Some("verify"));
    assert_eq!(running.version, 3);

    let steps: Vec<String> = store
        .jobs
        .step_history(job.job_id)
        .await?
        .into_iter()
        .map(|checkpoint| checkpoint.step)
        .collect();
    assert_eq!(steps, vec!["copy", "verify"]);

    let non_terminal = store
        .jobs
        .complete(job.job_id, JobStatus::InProgress, &JobResult::new("?"), &owner)
        .await;
    assert!(matches!(non_terminal, Err(DbError::InvalidTransition(_))));

    let result = JobResult::with_output("done", json!({"copied": 3}));
    assert!(
        store
            .jobs
            .complete(job.job_id, JobStatus::Succeeded, &result, &owner)
            .await?
    );
    // Repeating the same outcome is a no-op, a different one is a conflict.
    assert!(
        !store
            .jobs
            .complete(job.job_id, JobStatus::Succeeded, &result, &owner)
            .await?
    );
    let conflicting = store
        .jobs
        .complete(job.job_id, JobStatus::Failed, &JobResult::new("boom"), &owner)
        .await;
    assert!(matches!(conflicting, Err(DbError::Conflict(_))));

    assert!(!store.jobs.mark_running(job.job_id, &owner).await?);
    let late_step = store.jobs.update_step(job.job_id, "again").await;
    assert!(matches!(late_step, Err(DbError::InvalidTransition(_))));

    let report = store.jobs.status(job.job_id).await?;
    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(report.result, Some(result));

    let done = store.jobs.get(job.job_id).await?;
    assert_eq!(done.completed_by, Some(owner));
    assert!(done.updated_at >= running.updated_at);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let job_id = store.jobs.submit("echo", json!({}), None).await?.job_id;

    let claims = (0..8).map(|i| {
        let jobs = store.jobs.clone();
        let owner = ProcessId::new(format!("msid-{i}"));
        async move { jobs.mark_running(job_id, &owner).await }
    });
    let results = join_all(claims).await;

    let mut winners = 0;
    for result in results {
        if result? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.jobs.get(job_id).await?.status, JobStatus::InProgress);

    Ok(())
}

#[tokio::test]
async fn missing_jobs_are_not_found() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let missing = store.jobs.get(job_core::JobId::new()).await;
    assert!(matches!(missing, Err(DbError::NotFound(_))));
    assert!(
        !store
            .jobs
            .mark_running(job_core::JobId::new(), &ProcessId::new("msid-a"))
            .await?
    );
    Ok(())
}

#[tokio::test]
async fn expunge_removes_only_old_terminal_jobs() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");

    let finished = store.jobs.submit("echo", json!({}), None).await?;
    store.jobs.mark_running(finished.job_id, &owner).await?;
    store.jobs.update_step(finished.job_id, "halfway").await?;
    store
        .jobs
        .complete(finished.job_id, JobStatus::Succeeded, &JobResult::new("ok"), &owner)
        .await?;

    let waiting = store.jobs.submit("echo", json!({}), None).await?;

    let mut recent = Job::new("echo", json!({}));
    recent.status = JobStatus::Failed;
    recent.result = Some(JobResult::new("boom"));
    recent.updated_at = Utc::now() + Duration::hours(1);
    store.jobs.create(&recent).await?;

    assert_eq!(store.jobs.expunge(Utc::now() - Duration::hours(1)).await?, 0);

    let removed = store.jobs.expunge(Utc::now() + Duration::seconds(1)).await?;
    assert_eq!(removed, 1);
    assert!(store.jobs.find(finished.job_id).await?.is_none());
    assert!(store.jobs.step_history(finished.job_id).await?.is_empty());
    assert!(store.jobs.find(waiting.job_id).await?.is_some());
    assert!(store.jobs.find(recent.job_id).await?.is_some());

    Ok(())
}

#[tokio::test]
async fn list_filters_by_status_and_resource() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let vm = ResourceRef::new("vm", "7");

    let first = store.jobs.submit("start", json!({}), Some(vm.clone())).await?;
    let second = store.jobs.submit("stop", json!({}), Some(vm.clone())).await?;
    store.jobs.submit("start", json!({}), Some(ResourceRef::new("vm", "8"))).await?;
    store.jobs.mark_running(second.job_id, &owner).await?;

    let on_vm = store
        .jobs
        .list(JobFilter {
            resource: Some(vm),
            ..Default::default()
        })
        .await?;
    let ids: Vec<_> = on_vm.iter().map(|job| job.job_id).collect();
    assert_eq!(ids, vec![first.job_id, second.job_id]);

    let running = store.jobs.in_progress().await?;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].job_id, second.job_id);

    let starts = store
        .jobs
        .list(JobFilter {
            job_type: Some("start".to_string()),
            limit: Some(1),
            ..Default::default()
        })
        .await?;
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].job_id, first.job_id);

    Ok(())
}

#[tokio::test]
async fn cancellation_is_a_flag_on_unfinished_jobs() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");

    let job = store.jobs.submit("echo", json!({}), None).await?;
    assert!(store.jobs.request_cancel(job.job_id).await?);
    assert!(store.jobs.get(job.job_id).await?.cancel_requested);

    store.jobs.mark_running(job.job_id, &owner).await?;
    store
        .jobs
        .complete(job.job_id, JobStatus::Failed, &JobResult::new("cancelled"), &owner)
        .await?;
    assert!(!store.jobs.request_cancel(job.job_id).await?);

    Ok(())
}

#[tokio::test]
async fn work_submission_attaches_to_unfinished_work() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let volume = ResourceRef::new("volume", "v-1");

    let work = || {
        Job::new("snapshot", json!({}))
            .with_resource(Some(volume.clone()))
            .as_work()
    };

    let first = store.jobs.submit_work(work()).await?;
    assert!(!first.attached);

    let second = store.jobs.submit_work(work()).await?;
    assert!(second.attached);
    assert_eq!(second.job.job_id, first.job.job_id);
    assert_eq!(store.jobs.list(JobFilter::default()).await?.len(), 1);

    let pending = store.jobs.find_pending_work("volume:v-1:snapshot").await?;
    assert_eq!(pending.map(|job| job.job_id), Some(first.job.job_id));

    // A finished holder whose claim was never released does not block new work.
    store.jobs.mark_running(first.job.job_id, &owner).await?;
    store
        .jobs
        .complete(first.job.job_id, JobStatus::Succeeded, &JobResult::new("ok"), &owner)
        .await?;

    let third = store.jobs.submit_work(work()).await?;
    assert!(!third.attached);
    assert_ne!(third.job.job_id, first.job.job_id);

    Ok(())
}

#[tokio::test]
async fn orphans_are_requeued_once_per_read() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let dead = ProcessId::new("msid-dead");

    let job = store.jobs.submit("echo", json!({}), None).await?;
    store.jobs.mark_running(job.job_id, &dead).await?;
    let orphan = store.jobs.get(job.job_id).await?;

    assert!(store.jobs.requeue_orphan(&orphan).await?);
    assert!(!store.jobs.requeue_orphan(&orphan).await?);

    let requeued = store.jobs.get(job.job_id).await?;
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.owner, None);
    assert_eq!(requeued.recovery_attempts, 1);

    Ok(())
}

#[tokio::test]
async fn processes_are_live_while_heartbeating() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let alive = ProcessId::new("msid-alive");
    let dead = ProcessId::new("msid-dead");

    store.processes.register(&alive).await?;
    store
        .processes
        .register_at(&dead, Utc::now() - Duration::minutes(10))
        .await?;

    let cutoff = Utc::now() - Duration::seconds(30);
    assert_eq!(store.processes.live_processes(cutoff).await?, vec![alive.clone()]);

    store.processes.heartbeat(&dead).await?;
    assert_eq!(store.processes.live_processes(cutoff).await?.len(), 2);

    store.processes.mark_stopped(&alive).await?;
    assert_eq!(store.processes.live_processes(cutoff).await?, vec![dead.clone()]);
    let record = store.processes.get(&alive).await?;
    assert!(record.is_some_and(|record| record.stopped));

    Ok(())
}
