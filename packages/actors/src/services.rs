//! State shared by the dispatcher, its workers and its housekeeper.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use db::Database;
use db::repositories::{
    JobRepository, JoinRepository, ProcessRepository, SyncQueueRepository, WorkSubmission,
};
use job_core::{FrameworkConfig, Job, JobEvent, JobId, JobResult, JobStatus, ProcessId};

use crate::bus::MessageBus;
use crate::context::JobRequest;
use crate::handler::{JobHandlerRegistry, WakeupRegistry};
use crate::join_coordinator::JoinCoordinator;
use crate::messages::DispatchError;

/// Publish `event` on `bus` under its own subject, logging delivery failures.
pub(crate) fn publish_event(bus: &MessageBus, sender: &ProcessId, event: &JobEvent) {
    let payload = match serde_json::to_value(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!("Failed to serialize event {}: {}", event.description(), err);
            return;
        }
    };

    match bus.publish(sender.as_str(), &event.subject(), &payload) {
        Ok(_) => tracing::trace!("{}", event.description()),
        Err(err) => tracing::warn!("Publishing {} failed: {}", event.description(), err),
    }
}

fn check_request(request: &JobRequest) -> Result<(), DispatchError> {
    match &request.resource {
        Some(resource) if resource.is_reserved() => Err(DispatchError::InvalidRequest(format!(
            "resource type {} is reserved",
            resource.resource_type
        ))),
        _ => Ok(()),
    }
}

/// Parents waiting for a wakeup delivery in this process, without duplicates.
#[derive(Default)]
pub(crate) struct WakeupInbox {
    state: Mutex<InboxState>,
}

#[derive(Default)]
struct InboxState {
    order: VecDeque<JobId>,
    queued: HashSet<JobId>,
}

impl WakeupInbox {
    /// Returns `false` if the parent was already waiting.
    pub(crate) fn push(&self, parent: JobId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.queued.insert(parent) {
            return false;
        }
        state.order.push_back(parent);
        true
    }

    pub(crate) fn pop(&self) -> Option<JobId> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let parent = state.order.pop_front()?;
        state.queued.remove(&parent);
        Some(parent)
    }
}

/// Marks a job as being executed by a worker of this process.
///
/// Released on drop.
pub(crate) struct ExecutionGuard {
    job_id: JobId,
    busy: Arc<Mutex<HashSet<JobId>>>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.job_id);
    }
}

/// Repositories, registries and local coordination state of one process.
pub struct Services {
    pub(crate) process_id: ProcessId,
    pub(crate) config: FrameworkConfig,
    pub(crate) jobs: JobRepository,
    pub(crate) queues: SyncQueueRepository,
    pub(crate) joins: JoinRepository,
    pub(crate) processes: ProcessRepository,
    pub(crate) bus: Arc<MessageBus>,
    pub(crate) coordinator: JoinCoordinator,
    pub(crate) handlers: Arc<JobHandlerRegistry>,
    pub(crate) wakeups: Arc<WakeupRegistry>,
    /// Job types this process can execute.
    pub(crate) job_types: Vec<String>,
    pub(crate) inbox: WakeupInbox,
    busy: Arc<Mutex<HashSet<JobId>>>,
}

impl Services {
    pub(crate) fn new(
        db: Database,
        process_id: ProcessId,
        config: FrameworkConfig,
        handlers: Arc<JobHandlerRegistry>,
        wakeups: Arc<WakeupRegistry>,
    ) -> Self {
        let jobs = JobRepository::new(db.clone());
        let joins = JoinRepository::new(db.clone());
        let bus = Arc::new(MessageBus::new());
        let coordinator =
            JoinCoordinator::new(process_id.clone(), jobs.clone(), joins.clone(), bus.clone());

        Self {
            job_types: handlers.job_types(),
            process_id,
            config,
            jobs,
            queues: SyncQueueRepository::new(db.clone()),
            joins,
            processes: ProcessRepository::new(db),
            bus,
            coordinator,
            handlers,
            wakeups,
            inbox: WakeupInbox::default(),
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim local execution of `job_id`, unless a worker already runs it.
    pub(crate) fn try_acquire(&self, job_id: JobId) -> Option<ExecutionGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !busy.insert(job_id) {
            return None;
        }
        Some(ExecutionGuard {
            job_id,
            busy: self.busy.clone(),
        })
    }

    pub(crate) fn publish_event(&self, event: &JobEvent) {
        publish_event(&self.bus, &self.process_id, event);
    }

    /// Record a job and place it in the sync queue of its resource.
    ///
    /// A job that could not be enqueued is deleted again, so no job is left
    /// QUEUED without a queue item.
    pub(crate) async fn submit(&self, request: JobRequest) -> Result<Job, DispatchError> {
        check_request(&request)?;
        let job = request.to_job();
        self.jobs.create(&job).await?;
        if let Err(err) = self.enqueue(&job, request.exclusive).await {
            self.discard(&job).await;
            return Err(err);
        }
        Ok(job)
    }

    /// Record resumable work unless the same work is already pending.
    pub(crate) async fn submit_work(
        &self,
        request: JobRequest,
    ) -> Result<WorkSubmission, DispatchError> {
        check_request(&request)?;
        let submission = self.jobs.submit_work(request.to_job().as_work()).await?;
        if submission.attached {
            tracing::debug!(
                "Work {:?} attached to job {}",
                submission.job.work_key,
                submission.job.job_id
            );
        } else if let Err(err) = self.enqueue(&submission.job, request.exclusive).await {
            self.discard(&submission.job).await;
            return Err(err);
        }
        Ok(submission)
    }

    /// Remove a job that never made it into its queue.
    async fn discard(&self, job: &Job) {
        let removed = async {
            if job.work_key.is_some() {
                self.jobs.release_work_claim(job.job_id).await?;
            }
            self.jobs.delete(job.job_id).await
        }
        .await;
        match removed {
            Ok(()) => tracing::warn!("Discarded job {} that could not be enqueued", job.job_id),
            Err(err) => tracing::error!("Job {} left without a queue item: {}", job.job_id, err),
        }
    }

    async fn enqueue(&self, job: &Job, exclusive: bool) -> Result<(), DispatchError> {
        // Jobs without a resource sit alone in a private queue.
        let exclusive = job.resource.is_some() && exclusive;
        self.queues
            .enqueue(&job.queue_resource(), job.job_id, &job.job_type, exclusive)
            .await?;

        self.publish_event(&JobEvent::JobSubmitted {
            job_id: job.job_id,
            job_type: job.job_type.clone(),
            resource: job.resource.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Move `job` to a terminal status and release everything it holds.
    ///
    /// Returns `false` when the job had already finished.
    pub(crate) async fn finish(
        &self,
        job: &Job,
        status: JobStatus,
        result: JobResult,
    ) -> Result<bool, DispatchError> {
        let changed = match self
            .jobs
            .complete(job.job_id, status, &result, &self.process_id)
            .await
        {
            Ok(changed) => changed,
            Err(err) if err.is_conflict() => {
                tracing::warn!("Job {} finished elsewhere: {}", job.job_id, err);
                false
            }
            Err(err) => return Err(err.into()),
        };

        self.queues.remove_for_job(job.job_id).await?;
        if job.work_key.is_some() {
            self.jobs.release_work_claim(job.job_id).await?;
        }
        self.coordinator.disjoin_all(job.job_id).await?;

        if changed {
            self.coordinator
                .complete_join(job.job_id, status, &result)
                .await?;
        }
        Ok(changed)
    }
}
