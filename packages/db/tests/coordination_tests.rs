#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use job_core::{JobId, JobResult, JoinRecord, JoinStatus, ProcessId, ResourceRef};

fn types() -> Vec<String> {
    vec!["op".to_string()]
}

#[tokio::test]
async fn exclusive_items_are_served_one_at_a_time_in_order() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let vm = ResourceRef::new("vm", "1");
    let key = vm.queue_key();

    let first = JobId::new();
    let second = JobId::new();
    let third = JobId::new();
    store.queues.enqueue(&vm, first, "op", true).await?;
    store.queues.enqueue(&vm, second, "op", true).await?;
    store.queues.enqueue(&vm, third, "op", false).await?;

    let head = store.queues.try_dequeue_next(&key, &owner, &types()).await?;
    assert_eq!(head.as_ref().map(|item| item.job_id), Some(first));
    assert!(head.is_some_and(|item| item.owner == Some(owner.clone())));
    assert!(store.queues.try_dequeue_next(&key, &owner, &types()).await?.is_none());

    store.queues.remove_for_job(first).await?;
    let next = store.queues.try_dequeue_next(&key, &owner, &types()).await?;
    assert_eq!(next.map(|item| item.job_id), Some(second));
    assert!(store.queues.try_dequeue_next(&key, &owner, &types()).await?.is_none());

    store.queues.remove_for_job(second).await?;
    let last = store.queues.try_dequeue_next(&key, &owner, &types()).await?;
    assert_eq!(last.map(|item| item.job_id), Some(third));

    Ok(())
}

#[tokio::test]
async fn shared_items_overlap_but_never_pass_an_exclusive_one() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let vm = ResourceRef::new("vm", "2");
    let key = vm.queue_key();

    let shared_a = JobId::new();
    let shared_b = JobId::new();
    let exclusive = JobId::new();
    let shared_c = JobId::new();
    store.queues.enqueue(&vm, shared_a, "op", false).await?;
    store.queues.enqueue(&vm, shared_b, "op", false).await?;
    store.queues.enqueue(&vm, exclusive, "op", true).await?;
    store.queues.enqueue(&vm, shared_c, "op", false).await?;

    let a = store.queues.try_dequeue_next(&key, &owner, &types()).await?;
    let b = store.queues.try_dequeue_next(&key, &owner, &types()).await?;
    assert_eq!(a.map(|item| item.job_id), Some(shared_a));
    assert_eq!(b.map(|item| item.job_id), Some(shared_b));
    assert!(store.queues.try_dequeue_next(&key, &owner, &types()).await?.is_none());
    assert_eq!(store.queues.active_items(Some(&owner), false).await?.len(), 2);

    store.queues.remove_for_job(shared_a).await?;
    assert!(store.queues.try_dequeue_next(&key, &owner, &types()).await?.is_none());
    store.queues.remove_for_job(shared_b).await?;

    let x = store.queues.try_dequeue_next(&key, &owner, &types()).await?;
    assert_eq!(x.map(|item| item.job_id), Some(exclusive));
    assert_eq!(store.queues.active_items(None, true).await?.len(), 1);
    assert!(store.queues.try_dequeue_next(&key, &owner, &types()).await?.is_none());

    store.queues.remove_for_job(exclusive).await?;
    let c = store.queues.try_dequeue_next(&key, &owner, &types()).await?;
    assert_eq!(c.map(|item| item.job_id), Some(shared_c));

    Ok(())
}

#[tokio::test]
async fn empty_or_unhandled_queues_yield_nothing() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let vm = ResourceRef::new("vm", "3");

    assert!(
        store
            .queues
            .try_dequeue_next(&vm.queue_key(), &owner, &types())
            .await?
            .is_none()
    );

    store.queues.enqueue(&vm, JobId::new(), "other", true).await?;
    assert!(
        store
            .queues
            .try_dequeue_next(&vm.queue_key(), &owner, &types())
            .await?
            .is_none()
    );
    assert!(store.queues.ready_keys(&types(), 10).await?.is_empty());
    assert_eq!(
        store.queues.ready_keys(&["other".to_string()], 10).await?,
        vec![vm.queue_key()]
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_claim_an_exclusive_head_once() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let vm = ResourceRef::new("vm", "4");
    let head = JobId::new();
    store.queues.enqueue(&vm, head, "op", true).await?;
    store.queues.enqueue(&vm, JobId::new(), "op", true).await?;

    let attempts = (0..6).map(|i| {
        let queues = store.queues.clone();
        let key = vm.queue_key();
        let owner = ProcessId::new(format!("msid-{i}"));
        async move { queues.try_dequeue_next(&key, &owner, &types()).await }
    });

    let mut claimed = Vec::new();
    for result in join_all(attempts).await {
        if let Some(item) = result? {
            claimed.push(item.job_id);
        }
    }
    assert_eq!(claimed, vec![head]);

    Ok(())
}

#[tokio::test]
async fn exclusive_and_shared_items_never_run_together_under_contention()
-> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let vm = ResourceRef::new("vm", "contended");
    let key = vm.queue_key();

    for round in 0..5 {
        let exclusive = JobId::new();
        store.queues.enqueue(&vm, exclusive, "op", true).await?;

        // Shared items land while other workers are already taking snapshots.
        let enqueues = (0..3).map(|_| {
            let queues = store.queues.clone();
            let vm = vm.clone();
            async move { queues.enqueue(&vm, JobId::new(), "op", false).await }
        });
        let dequeues = (0..6).map(|i| {
            let queues = store.queues.clone();
            let key = key.clone();
            let owner = ProcessId::new(format!("msid-{round}-{i}"));
            async move { queues.try_dequeue_next(&key, &owner, &types()).await }
        });
        let (enqueued, dequeued) = tokio::join!(join_all(enqueues), join_all(dequeues));
        for result in enqueued {
            result?;
        }
        for result in dequeued {
            result?;
        }

        let active = store.queues.active_items(None, false).await?;
        if active.iter().any(|item| item.exclusive) {
            assert_eq!(active.len(), 1, "exclusive item shares its queue: {active:?}");
        }

        for item in store.queues.items_for_key(&key).await? {
            store.queues.remove_for_job(item.job_id).await?;
        }
    }

    Ok(())
}

#[tokio::test]
async fn pruning_keeps_queues_that_still_hold_items() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let idle = ResourceRef::new("vm", "idle");
    let busy = ResourceRef::new("vm", "busy");

    let done = JobId::new();
    store.queues.enqueue(&idle, done, "op", true).await?;
    store.queues.remove_for_job(done).await?;
    let waiting = JobId::new();
    store.queues.enqueue(&busy, waiting, "op", true).await?;

    store.queues.prune_gates(Utc::now() + Duration::seconds(1)).await?;

    let head = store.queues.try_dequeue_next(&busy.queue_key(), &owner, &types()).await?;
    assert_eq!(head.map(|item| item.job_id), Some(waiting));

    let again = JobId::new();
    store.queues.enqueue(&idle, again, "op", true).await?;
    let head = store.queues.try_dequeue_next(&idle.queue_key(), &owner, &types()).await?;
    assert_eq!(head.map(|item| item.job_id), Some(again));

    Ok(())
}

#[tokio::test]
async fn released_items_keep_their_place() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let dead = ProcessId::new("msid-dead");
    let alive = ProcessId::new("msid-alive");
    let vm = ResourceRef::new("vm", "5");
    let key = vm.queue_key();

    let first = JobId::new();
    let second = JobId::new();
    store.queues.enqueue(&vm, first, "op", true).await?;
    store.queues.enqueue(&vm, second, "op", true).await?;
    store.queues.try_dequeue_next(&key, &dead, &types()).await?;

    store.queues.release_job(first).await?;
    assert!(store.queues.active_items(None, false).await?.is_empty());

    let retry = store.queues.try_dequeue_next(&key, &alive, &types()).await?;
    assert_eq!(retry.map(|item| item.job_id), Some(first));

    Ok(())
}

#[tokio::test]
async fn blocked_items_and_ready_keys_report_waiting_work() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let vm = ResourceRef::new("vm", "6");
    let disk = ResourceRef::new("disk", "6");

    store.queues.enqueue(&disk, JobId::new(), "op", false).await?;
    store.queues.enqueue(&vm, JobId::new(), "op", true).await?;
    store.queues.enqueue(&vm, JobId::new(), "op", true).await?;
    store.queues.try_dequeue_next(&vm.queue_key(), &owner, &types()).await?;

    assert_eq!(
        store.queues.ready_keys(&types(), 10).await?,
        vec![disk.queue_key(), vm.queue_key()]
    );
    assert_eq!(store.queues.ready_keys(&types(), 1).await?.len(), 1);

    let later = Utc::now() + Duration::seconds(1);
    assert_eq!(store.queues.blocked_items(later, false).await?.len(), 2);
    let blocked_exclusive = store.queues.blocked_items(later, true).await?;
    assert_eq!(blocked_exclusive.len(), 1);
    assert_eq!(blocked_exclusive[0].queue_key, vm.queue_key());
    assert!(
        store
            .queues
            .blocked_items(Utc::now() - Duration::hours(1), false)
            .await?
            .is_empty()
    );

    Ok(())
}

#[tokio::test]
async fn ready_keys_look_past_blocked_queues() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-other");
    let limit = 4;

    for i in 0..limit * 2 {
        let vm = ResourceRef::new("vm", format!("busy-{i}"));
        store.queues.enqueue(&vm, JobId::new(), "op", true).await?;
        store.queues.enqueue(&vm, JobId::new(), "op", true).await?;
        assert!(store.queues.try_dequeue_next(&vm.queue_key(), &owner, &types()).await?.is_some());
    }
    let unhandled = ResourceRef::new("vm", "unhandled");
    store.queues.enqueue(&unhandled, JobId::new(), "other", false).await?;
    let free = ResourceRef::new("vm", "free");
    store.queues.enqueue(&free, JobId::new(), "op", false).await?;

    assert_eq!(store.queues.ready_keys(&types(), limit).await?, vec![free.queue_key()]);

    Ok(())
}

#[tokio::test]
async fn joins_are_idempotent_and_disjoin_is_safe_to_repeat() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let parent = JobId::new();
    let child = JobId::new();
    let other = JobId::new();

    let record = JoinRecord::new(parent, child, owner.clone()).with_wakeup("resume", "");
    let first = store.joins.join(&record).await?;
    let again = store
        .joins
        .join(&JoinRecord::new(parent, child, owner.clone()))
        .await?;
    assert_eq!(first, again);
    store
        .joins
        .join(&JoinRecord::new(parent, other, owner.clone()))
        .await?;
    assert_eq!(store.joins.pending_for_parent(parent).await?.len(), 2);

    store.joins.disjoin(parent, child).await?;
    store.joins.disjoin(parent, child).await?;
    assert_eq!(store.joins.pending_for_parent(parent).await?.len(), 1);

    store.joins.disjoin_all(parent).await?;
    store.joins.disjoin_all(parent).await?;
    assert!(store.joins.pending_for_parent(parent).await?.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completed_joins_are_delivered_exactly_once() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let parent = JobId::new();
    let child = JobId::new();

    let join_id = store
        .joins
        .join(&JoinRecord::new(parent, child, owner.clone()).with_wakeup("resume", "target"))
        .await?;

    // Nothing to deliver while the child runs.
    assert!(store.joins.claim_wakeup(join_id, &owner).await?.is_none());
    assert!(store.joins.find_ready_to_wake(child, None).await?.is_empty());

    let marked = store
        .joins
        .complete_join(child, JoinStatus::Succeeded, &JobResult::new("ok"), &owner)
        .await?;
    assert_eq!(marked, 1);
    assert_eq!(
        store
            .joins
            .complete_join(child, JoinStatus::Failed, &JobResult::new("late"), &owner)
            .await?,
        0
    );

    assert_eq!(store.joins.find_ready_to_wake(child, Some(&owner)).await?, vec![parent]);
    assert!(
        store
            .joins
            .find_ready_to_wake(child, Some(&ProcessId::new("msid-b")))
            .await?
            .is_empty()
    );

    let claims = (0..6).map(|i| {
        let joins = store.joins.clone();
        let claimer = ProcessId::new(format!("msid-{i}"));
        async move { joins.claim_wakeup(join_id, &claimer).await }
    });
    let mut delivered = Vec::new();
    for result in join_all(claims).await {
        if let Some(record) = result? {
            delivered.push(record);
        }
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].join_status, Some(JoinStatus::Succeeded));
    assert_eq!(delivered[0].wakeup_target, "target");
    assert_eq!(
        delivered[0].join_result.as_ref().map(|result| result.summary.as_str()),
        Some("ok")
    );

    assert!(store.joins.get(join_id).await?.is_none());
    assert!(store.joins.find_ready_to_wake(child, None).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn joins_expire_at_their_deadline_not_before() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let parent = JobId::new();

    let record = JoinRecord::new(parent, JobId::new(), owner.clone())
        .with_expiration(StdDuration::from_secs(60));
    let join_id = store.joins.join(&record).await?;

    let just_before = record.expires_at - Duration::milliseconds(1);
    assert!(store.joins.find_expired(just_before).await?.is_empty());
    assert_eq!(store.joins.find_expired(record.expires_at).await?, vec![join_id]);

    assert!(!store.joins.expire(join_id, &owner, just_before).await?);

    let due = JoinRecord::new(parent, JobId::new(), owner.clone())
        .with_poll_interval(StdDuration::from_secs(60))
        .with_expiration(StdDuration::ZERO);
    let due_id = store.joins.join(&due).await?;
    let now = due.expires_at + Duration::milliseconds(5);
    assert!(store.joins.expire(due_id, &owner, now).await?);
    assert!(!store.joins.expire(due_id, &owner, now).await?);

    // The timed out join is due at the very instant it expired.
    let ready = store.joins.ready_for_process(&owner, now).await?;
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].join_id, due_id);
    assert_eq!(ready[0].join_status, Some(JoinStatus::TimedOut));

    Ok(())
}

#[tokio::test]
async fn cross_process_polling_honours_the_poll_interval() -> Result<(), Box<dyn Error>> {
    let store = common::setup_db().await?;
    let owner = ProcessId::new("msid-a");
    let child = JobId::new();

    let record = JoinRecord::new(JobId::new(), child, owner.clone())
        .with_poll_interval(StdDuration::from_secs(5));
    store.joins.join(&record).await?;
    store
        .joins
        .complete_join(child, JoinStatus::Failed, &JobResult::new("boom"), &owner)
        .await?;

    assert!(
        store
            .joins
            .ready_for_process(&owner, record.created_at)
            .await?
            .is_empty()
    );
    let due = record.next_check_at;
    assert_eq!(store.joins.ready_for_process(&owner, due).await?.len(), 1);
    assert!(
        store
            .joins
            .ready_for_process(&ProcessId::new("msid-b"), due)
            .await?
            .is_empty()
    );

    Ok(())
}
