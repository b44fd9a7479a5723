//! Worker actor for executing jobs and delivering wakeups.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures_util::FutureExt;
use job_core::{Job, JobEvent, JobId, JobResult, JobStatus, SyncQueueItem};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::context::JobContext;
use crate::handler::{HandlerOutcome, HandlerResult, Wakeup};
use crate::messages::{DispatchError, WorkerMessage};
use crate::services::Services;

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    /// Job currently executing, if any.
    pub current_job: Option<JobId>,
    services: Arc<Services>,
    /// Set while a poll is being handled so the ticker does not pile up polls.
    polling: Arc<AtomicBool>,
}

impl WorkerActorState {
    /// Check if the worker is idle.
    pub fn is_idle(&self) -> bool {
        self.current_job.is_none()
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub(crate) services: Arc<Services>,
}

/// Worker actor that executes jobs.
///
/// Each poll handles at most one unit of work: a pending wakeup delivery
/// first, otherwise the next dequeuable sync queue item of a handled type.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        let polling = Arc::new(AtomicBool::new(false));

        // Start the work loop
        let myself_clone = myself.clone();
        let ticker_polling = polling.clone();
        let poll_interval = args.services.config.worker_poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if ticker_polling.swap(true, Ordering::AcqRel) {
                    continue;
                }
                if myself_clone.send_message(WorkerMessage::Poll).is_err() {
                    break;
                }
            }
        });

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            current_job: None,
            services: args.services,
            polling,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                state.polling.store(true, Ordering::Release);
                let worked = match poll_once(state).await {
                    Ok(worked) => worked,
                    Err(e) => {
                        tracing::warn!("Worker {} poll failed: {}", state.worker_id, e);
                        false
                    }
                };
                state.current_job = None;
                state.polling.store(false, Ordering::Release);

                // Keep draining while there is work.
                if worked {
                    myself.send_message(WorkerMessage::Poll)?;
                }
            }

            WorkerMessage::IsIdle { reply } => {
                let _ = reply.send(state.is_idle());
            }
        }

        Ok(())
    }
}

/// Handle one unit of work. Returns `false` when there was nothing to do.
async fn poll_once(state: &mut WorkerActorState) -> Result<bool, DispatchError> {
    let services = state.services.clone();

    if let Some(parent) = services.inbox.pop() {
        state.current_job = Some(parent);
        deliver_wakeup(&services, parent).await?;
        return Ok(true);
    }

    let keys = services
        .queues
        .ready_keys(&services.job_types, services.config.ready_scan_limit)
        .await?;
    for key in keys {
        if let Some(item) = services
            .queues
            .try_dequeue_next(&key, &services.process_id, &services.job_types)
            .await?
        {
            state.current_job = Some(item.job_id);
            run_item(&services, item).await?;
            return Ok(true);
        }
    }

    Ok(false)
}

/// Start the job behind a claimed queue item and run its handler.
async fn run_item(services: &Arc<Services>, item: SyncQueueItem) -> Result<(), DispatchError> {
    let job_id = item.job_id;

    if !services.jobs.mark_running(job_id, &services.process_id).await? {
        match services.jobs.find(job_id).await? {
            Some(job) if job.status == JobStatus::Queued => {
                tracing::debug!("Job {} is contended, giving back item {}", job_id, item.item_id);
                services.queues.release_job(job_id).await?;
            }
            Some(job) if job.status == JobStatus::InProgress => {
                tracing::warn!(
                    "Item {} points at job {} already running on {:?}",
                    item.item_id,
                    job_id,
                    job.owner
                );
            }
            _ => {
                tracing::debug!("Dropping item {} of finished or missing job {}", item.item_id, job_id);
                services.queues.remove_for_job(job_id).await?;
            }
        }
        return Ok(());
    }

    let job = services.jobs.get(job_id).await?;
    services.publish_event(&JobEvent::JobStarted {
        job_id,
        owner: services.process_id.clone(),
        timestamp: Utc::now(),
    });

    let Some(guard) = services.try_acquire(job_id) else {
        tracing::warn!("Job {} is already executing in this process", job_id);
        return Ok(());
    };

    let Some(handler) = services.handlers.get(&job.job_type) else {
        services
            .finish(
                &job,
                JobStatus::Failed,
                JobResult::new(format!("No handler for job type: {}", job.job_type)),
            )
            .await?;
        return Ok(());
    };

    tracing::debug!("Running job {} ({})", job_id, job.job_type);
    let ctx = JobContext::new(job.clone(), services.clone());
    let outcome = guarded(handler.handle(ctx)).await;
    let rewake = settle(services, &job, outcome).await?;
    drop(guard);

    if rewake {
        services.inbox.push(job_id);
    }
    Ok(())
}

/// Hand one completed join of `parent` to its wakeup handler.
async fn deliver_wakeup(services: &Arc<Services>, parent: JobId) -> Result<(), DispatchError> {
    let Some(guard) = services.try_acquire(parent) else {
        // The running worker rescans ready joins when the parent suspends.
        tracing::debug!("Job {} is busy, deferring its wakeup", parent);
        return Ok(());
    };

    let mut delivered = None;
    for candidate in services.joins.ready_for_parent(parent).await? {
        if let Some(join) = services
            .joins
            .claim_wakeup(candidate.join_id, &services.process_id)
            .await?
        {
            delivered = Some(join);
            break;
        }
    }
    let Some(join) = delivered else {
        return Ok(());
    };

    let job = match services.jobs.find(parent).await? {
        Some(job) if job.status == JobStatus::InProgress => job,
        other => {
            tracing::info!(
                "Dropping wakeup {} for job {} ({:?})",
                join.join_id,
                parent,
                other.map(|job| job.status)
            );
            return Ok(());
        }
    };

    let wakeup = Wakeup { join };
    services.publish_event(&JobEvent::JoinWoken {
        join_id: wakeup.join.join_id,
        parent_job_id: parent,
        child_job_id: wakeup.child_job_id(),
        status: wakeup.status(),
        timestamp: Utc::now(),
    });

    let Some(handler) = services.wakeups.get(&wakeup.join.wakeup_handler) else {
        services
            .finish(
                &job,
                JobStatus::Failed,
                JobResult::new(format!(
                    "No wakeup handler named: {}",
                    wakeup.join.wakeup_handler
                )),
            )
            .await?;
        return Ok(());
    };

    tracing::debug!(
        "Waking job {} with {} on {}",
        parent,
        wakeup.join.wakeup_handler,
        wakeup.target()
    );
    let ctx = JobContext::new(job.clone(), services.clone());
    let outcome = guarded(handler.on_wakeup(ctx, wakeup)).await;
    let rewake = settle(services, &job, outcome).await?;
    drop(guard);

    if rewake {
        services.inbox.push(parent);
    }
    Ok(())
}

/// Await a handler future, turning a panic into a failure message.
async fn guarded<F>(future: F) -> HandlerResult
where
    F: std::future::Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("Handler panicked: {}", message))
        }
    }
}

/// Apply a handler's outcome to its job.
///
/// Returns `true` when the job suspended and a completed join is already
/// waiting for delivery.
async fn settle(
    services: &Services,
    job: &Job,
    outcome: HandlerResult,
) -> Result<bool, DispatchError> {
    match outcome {
        Ok(HandlerOutcome::Complete(result)) => {
            services.finish(job, JobStatus::Succeeded, result).await?;
        }
        Ok(HandlerOutcome::Fail(message)) | Err(message) => {
            tracing::info!("Job {} failed: {}", job.job_id, message);
            services
                .finish(job, JobStatus::Failed, JobResult::new(message))
                .await?;
        }
        Ok(HandlerOutcome::Suspend) => {
            let pending = services.joins.pending_for_parent(job.job_id).await?;
            let ready = services.joins.ready_for_parent(job.job_id).await?;
            if pending.is_empty() && ready.is_empty() {
                services
                    .finish(
                        job,
                        JobStatus::Failed,
                        JobResult::new("Suspended without any join to wait on"),
                    )
                    .await?;
            } else if !ready.is_empty() {
                // A child finished while the handler was still running.
                return Ok(true);
            } else {
                tracing::debug!("Job {} waits on {} join(s)", job.job_id, pending.len());
            }
        }
    }
    Ok(false)
}
