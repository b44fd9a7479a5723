//! Join coordination: recording "parent waits on child" edges and
//! announcing child completion.
//!
//! A completed join reaches its parent on one of two paths. Parents owned
//! by the completing process are woken right away through the bus; parents
//! owned elsewhere are found by their own housekeeper, which polls the store.
//! Both paths end in [`JoinRepository::claim_wakeup`], so each join is
//! delivered once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::repositories::{JobRepository, JoinRepository};
use job_core::{
    Job, JobEvent, JobId, JobResult, JobStatus, JoinId, JoinRecord, JoinStatus, ProcessId,
};

use crate::bus::MessageBus;
use crate::messages::DispatchError;
use crate::services::publish_event;

#[derive(Clone)]
pub struct JoinCoordinator {
    process_id: ProcessId,
    jobs: JobRepository,
    joins: JoinRepository,
    bus: Arc<MessageBus>,
}

impl JoinCoordinator {
    pub fn new(
        process_id: ProcessId,
        jobs: JobRepository,
        joins: JoinRepository,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            process_id,
            jobs,
            joins,
            bus,
        }
    }

    /// Make `parent` wait on `child`.
    ///
    /// If the child already finished, the join is recorded as completed and
    /// is delivered once the parent suspends.
    pub async fn join(
        &self,
        parent: &Job,
        child: JobId,
        poll_interval: Duration,
        expiration: Duration,
        wakeup_handler: &str,
        wakeup_target: &str,
    ) -> Result<JoinId, DispatchError> {
        let child_job = self.jobs.get(child).await?;

        let record = JoinRecord::new(parent.job_id, child, self.process_id.clone())
            .with_child_owner(child_job.owner.clone())
            .with_poll_interval(poll_interval)
            .with_expiration(expiration)
            .with_resource(parent.resource.clone())
            .with_wakeup(wakeup_handler, wakeup_target);
        let join_id = self.joins.join(&record).await?;

        // Re-read after recording: a child finishing in between would have
        // missed this join.
        let child_job = self.jobs.get(child).await?;
        if let Some(status) = JoinStatus::from_job_status(child_job.status) {
            let result = child_job
                .result
                .clone()
                .unwrap_or_else(|| JobResult::new(status.as_str()));
            let completed_by = child_job
                .completed_by
                .clone()
                .unwrap_or_else(|| self.process_id.clone());
            self.joins
                .complete_join(child, status, &result, &completed_by)
                .await?;
            tracing::debug!("Job {} joined already finished job {}", parent.job_id, child);
        }

        Ok(join_id)
    }

    pub async fn disjoin(&self, parent: JobId, child: JobId) -> Result<(), DispatchError> {
        Ok(self.joins.disjoin(parent, child).await?)
    }

    pub async fn disjoin_all(&self, parent: JobId) -> Result<(), DispatchError> {
        Ok(self.joins.disjoin_all(parent).await?)
    }

    /// Record the child's terminal outcome on every join waiting on it and
    /// announce the completion on the local bus.
    pub async fn complete_join(
        &self,
        child: JobId,
        status: JobStatus,
        result: &JobResult,
    ) -> Result<usize, DispatchError> {
        let Some(join_status) = JoinStatus::from_job_status(status) else {
            return Err(DispatchError::Store(db::DbError::InvalidTransition(format!(
                "Job {} is {}, joins complete only on terminal status",
                child, status
            ))));
        };

        let marked = self
            .joins
            .complete_join(child, join_status, result, &self.process_id)
            .await?;
        if marked > 0 {
            tracing::debug!("Job {} completed {} join(s)", child, marked);
        }

        publish_event(
            &self.bus,
            &self.process_id,
            &JobEvent::JobCompleted {
                job_id: child,
                status,
                result: result.clone(),
                completed_by: self.process_id.clone(),
                timestamp: Utc::now(),
            },
        );

        Ok(marked)
    }

    /// Parents with an undelivered, completed join on `child`.
    pub async fn find_ready_to_wake(
        &self,
        child: JobId,
        parent_owner: Option<&ProcessId>,
    ) -> Result<Vec<JobId>, DispatchError> {
        Ok(self.joins.find_ready_to_wake(child, parent_owner).await?)
    }

    pub async fn find_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<JoinId>, DispatchError> {
        Ok(self.joins.find_expired(cutoff).await?)
    }

    /// Time out every open join whose expiration has passed.
    ///
    /// Returns how many joins this call expired.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let mut expired = 0;
        for join_id in self.find_expired(now).await? {
            if self.joins.expire(join_id, &self.process_id, now).await? {
                tracing::info!("Join {} timed out", join_id);
                expired += 1;
            }
        }
        Ok(expired)
    }
}
