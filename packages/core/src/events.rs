//! Job lifecycle events and the bus subjects they are published under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobResult, JobStatus, JoinId, JoinStatus, ProcessId, ResourceRef};

/// Subject naming for bus publications.
pub mod subjects {
    use crate::JobId;

    /// Matches every completion subject.
    pub const JOB_COMPLETED_ALL: &str = "job.completed.*";
    /// Matches every job lifecycle subject.
    pub const JOB_ALL: &str = "job.>";
    pub const JOBS_EXPUNGED: &str = "jobs.expunged";

    pub fn job_submitted(job_id: JobId) -> String {
        format!("job.submitted.{job_id}")
    }

    pub fn job_started(job_id: JobId) -> String {
        format!("job.started.{job_id}")
    }

    pub fn job_step(job_id: JobId) -> String {
        format!("job.step.{job_id}")
    }

    pub fn job_completed(job_id: JobId) -> String {
        format!("job.completed.{job_id}")
    }

    pub fn job_requeued(job_id: JobId) -> String {
        format!("job.requeued.{job_id}")
    }

    pub fn job_woken(job_id: JobId) -> String {
        format!("job.woken.{job_id}")
    }
}

/// Events emitted by the framework for in-process observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job was recorded and enqueued.
    JobSubmitted {
        job_id: JobId,
        job_type: String,
        resource: Option<ResourceRef>,
        timestamp: DateTime<Utc>,
    },
    /// A worker claimed a job.
    JobStarted {
        job_id: JobId,
        owner: ProcessId,
        timestamp: DateTime<Utc>,
    },
    /// A resumable job recorded a checkpoint.
    JobStepUpdated {
        job_id: JobId,
        step: String,
        timestamp: DateTime<Utc>,
    },
    /// A job reached its terminal status.
    JobCompleted {
        job_id: JobId,
        status: JobStatus,
        result: JobResult,
        completed_by: ProcessId,
        timestamp: DateTime<Utc>,
    },
    /// A job of a dead process was returned to its queue.
    JobRequeued {
        job_id: JobId,
        previous_owner: Option<ProcessId>,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A parent job was woken from a join.
    JoinWoken {
        join_id: JoinId,
        parent_job_id: JobId,
        child_job_id: JobId,
        status: JoinStatus,
        timestamp: DateTime<Utc>,
    },
    /// The housekeeper purged old terminal jobs.
    JobsExpunged {
        count: u64,
        cutoff: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Bus subject this event is published under.
    pub fn subject(&self) -> String {
        match self {
            JobEvent::JobSubmitted { job_id, .. } => subjects::job_submitted(*job_id),
            JobEvent::JobStarted { job_id, .. } => subjects::job_started(*job_id),
            JobEvent::JobStepUpdated { job_id, .. } => subjects::job_step(*job_id),
            JobEvent::JobCompleted { job_id, .. } => subjects::job_completed(*job_id),
            JobEvent::JobRequeued { job_id, .. } => subjects::job_requeued(*job_id),
            JobEvent::JoinWoken { parent_job_id, .. } => subjects::job_woken(*parent_job_id),
            JobEvent::JobsExpunged { .. } => subjects::JOBS_EXPUNGED.to_string(),
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobSubmitted { timestamp, .. }
            | JobEvent::JobStarted { timestamp, .. }
            | JobEvent::JobStepUpdated { timestamp, .. }
            | JobEvent::JobCompleted { timestamp, .. }
            | JobEvent::JobRequeued { timestamp, .. }
            | JobEvent::JoinWoken { timestamp, .. }
            | JobEvent::JobsExpunged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobSubmitted { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobStepUpdated { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobRequeued { job_id, .. } => Some(*job_id),
            JobEvent::JoinWoken { parent_job_id, .. } => Some(*parent_job_id),
            JobEvent::JobsExpunged { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobSubmitted {
                job_id, job_type, ..
            } => format!("Job {} ({}) submitted", job_id, job_type),
            JobEvent::JobStarted { job_id, owner, .. } => {
                format!("Job {} started by {}", job_id, owner)
            }
            JobEvent::JobStepUpdated { job_id, step, .. } => {
                format!("Job {} reached step {}", job_id, step)
            }
            JobEvent::JobCompleted { job_id, status, .. } => {
                format!("Job {} -> {}", job_id, status)
            }
            JobEvent::JobRequeued {
                job_id, attempt, ..
            } => format!("Job {} requeued (recovery {})", job_id, attempt),
            JobEvent::JoinWoken {
                parent_job_id,
                child_job_id,
                status,
                ..
            } => format!("Job {} woken by {} ({})", parent_job_id, child_job_id, status),
            JobEvent::JobsExpunged { count, .. } => format!("{} jobs expunged", count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_event_uses_completion_subject() {
        let job_id = JobId::new();
        let event = JobEvent::JobCompleted {
            job_id,
            status: JobStatus::Succeeded,
            result: JobResult::new("ok"),
            completed_by: ProcessId::new("msid-a"),
            timestamp: Utc::now(),
        };
        assert_eq!(event.subject(), subjects::job_completed(job_id));
        assert_eq!(event.job_id(), Some(job_id));
    }
}
