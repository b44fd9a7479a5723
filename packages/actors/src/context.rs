//! What a running handler sees of the framework.

use std::sync::Arc;
use std::time::Duration;

use db::repositories::WorkSubmission;
use job_core::{Job, JobEvent, JobId, JoinId, JoinRecord, ProcessId, ResourceRef};
use serde_json::Value;

use crate::bus::MessageBus;
use crate::messages::DispatchError;
use crate::services::Services;

/// A request to run one unit of work.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_type: String,
    pub payload: Value,
    pub resource: Option<ResourceRef>,
    /// Whether the job needs its resource to itself.
    pub exclusive: bool,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            resource: None,
            exclusive: false,
        }
    }

    /// Serialize the job with other work on `resource`, exclusively by default.
    pub fn on_resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self.exclusive = true;
        self
    }

    /// Allow overlap with other shared jobs on the same resource.
    pub fn shared(mut self) -> Self {
        self.exclusive = false;
        self
    }

    pub(crate) fn to_job(&self) -> Job {
        Job::new(self.job_type.clone(), self.payload.clone()).with_resource(self.resource.clone())
    }
}

/// Handle given to job and wakeup handlers for the job being executed.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    services: Arc<Services>,
}

impl JobContext {
    pub(crate) fn new(job: Job, services: Arc<Services>) -> Self {
        Self { job, services }
    }

    /// The job record as it was when execution started.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.job_id
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    /// Process executing this job.
    pub fn process_id(&self) -> &ProcessId {
        &self.services.process_id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.services.bus
    }

    /// Submit a child job.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, DispatchError> {
        Ok(self.services.submit(request).await?.job_id)
    }

    /// Submit resumable work, attaching to unfinished work on the same target.
    pub async fn submit_work(&self, request: JobRequest) -> Result<WorkSubmission, DispatchError> {
        self.services.submit_work(request).await
    }

    /// Wait on `child` with the configured poll interval and expiration.
    ///
    /// `wakeup_handler` must be registered in this process; it receives
    /// `wakeup_target` when the join fires.
    pub async fn join(
        &self,
        child: JobId,
        wakeup_handler: &str,
        wakeup_target: &str,
    ) -> Result<JoinId, DispatchError> {
        let config = &self.services.config;
        self.join_with(
            child,
            config.join_poll_interval,
            config.join_expiration,
            wakeup_handler,
            wakeup_target,
        )
        .await
    }

    /// Wait on `child` with an explicit poll interval and expiration.
    pub async fn join_with(
        &self,
        child: JobId,
        poll_interval: Duration,
        expiration: Duration,
        wakeup_handler: &str,
        wakeup_target: &str,
    ) -> Result<JoinId, DispatchError> {
        if !self.services.wakeups.contains(wakeup_handler) {
            return Err(DispatchError::UnknownWakeupHandler(wakeup_handler.to_string()));
        }

        self.services
            .coordinator
            .join(
                &self.job,
                child,
                poll_interval,
                expiration,
                wakeup_handler,
                wakeup_target,
            )
            .await
    }

    /// Stop waiting on `child`. Idempotent.
    pub async fn disjoin(&self, child: JobId) -> Result<(), DispatchError> {
        self.services.coordinator.disjoin(self.job.job_id, child).await
    }

    /// Joins of this job not delivered yet, whether or not their child finished.
    pub async fn pending_joins(&self) -> Result<Vec<JoinRecord>, DispatchError> {
        let joins = &self.services.joins;
        let mut pending = joins.pending_for_parent(self.job.job_id).await?;
        pending.extend(joins.ready_for_parent(self.job.job_id).await?);
        pending.sort_by_key(|join| join.join_id);
        Ok(pending)
    }

    /// Persist a resumable checkpoint.
    pub async fn update_step(&self, step: &str) -> Result<(), DispatchError> {
        self.services.jobs.update_step(self.job.job_id, step).await?;
        self.services.publish_event(&JobEvent::JobStepUpdated {
            job_id: self.job.job_id,
            step: step.to_string(),
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Whether someone asked this job to stop. The handler decides how.
    pub async fn cancel_requested(&self) -> Result<bool, DispatchError> {
        Ok(self.services.jobs.get(self.job.job_id).await?.cancel_requested)
    }
}
