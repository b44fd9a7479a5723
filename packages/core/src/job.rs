//! Job domain types for units of asynchronous work.

use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

use crate::{ProcessId, ResourceRef};

static ULID_GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Generate a ULID that sorts after every ULID previously generated by this process.
///
/// Sync queue ordering relies on this: two items enqueued within the same
/// millisecond still compare in enqueue order.
pub fn next_ulid() -> Ulid {
    let mut generator = ULID_GENERATOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    generator.generate().unwrap_or_else(|_| Ulid::new())
}

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(next_ulid())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
///
/// Transitions are monotonic: `Queued -> InProgress -> {Succeeded | Failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in its sync queue.
    #[default]
    Queued,
    /// Job was claimed by a worker and is executing or awaiting joins.
    InProgress,
    /// Handler returned a result.
    Succeeded,
    /// Handler raised an error, or the job was abandoned.
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Succeeded)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }

    /// Get a simple status string for display and queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Human-readable summary of the result.
    pub summary: String,
    /// Optional structured output data as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl JobResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            output: None,
        }
    }

    pub fn with_output(summary: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            summary: summary.into(),
            output: Some(output),
        }
    }
}

/// Answer to a status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// A durable record of one submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub job_id: JobId,
    /// Type of job (used for routing to handlers).
    pub job_type: String,
    /// Job payload as JSON.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: JobStatus,
    /// Set once the job is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Process currently responsible for the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ProcessId>,
    /// Target resource, used as the sync queue key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    /// Handler-defined checkpoint of resumable progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// De-duplication key for resumable work jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_key: Option<String>,
    /// Cooperative cancellation flag, observed by the handler.
    #[serde(default)]
    pub cancel_requested: bool,
    /// How many times the job was recovered from a dead owner.
    #[serde(default)]
    pub recovery_attempts: u32,
    /// Process that moved the job to its terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<ProcessId>,
    /// When the job was created.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every write.
    #[serde(default)]
    pub version: u64,
}

impl Job {
    /// Create a new queued job.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Queued,
            result: None,
            owner: None,
            resource: None,
            step: None,
            work_key: None,
            cancel_requested: false,
            recovery_attempts: 0,
            completed_by: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Target a resource.
    pub fn with_resource(mut self, resource: Option<ResourceRef>) -> Self {
        self.resource = resource;
        self
    }

    /// Mark this job as resumable work on its resource.
    ///
    /// Jobs without a resource cannot be de-duplicated and keep no work key.
    pub fn as_work(mut self) -> Self {
        self.work_key = self
            .resource
            .as_ref()
            .map(|resource| work_key(resource, &self.job_type));
        self
    }

    /// Key of the sync queue this job is serialized through.
    ///
    /// Jobs without a resource get a private queue of their own.
    pub fn queue_resource(&self) -> ResourceRef {
        self.resource
            .clone()
            .unwrap_or_else(|| ResourceRef::private_queue(self.job_id))
    }

    pub fn report(&self) -> JobStatusReport {
        JobStatusReport {
            job_id: self.job_id,
            status: self.status,
            result: self.result.clone(),
            step: self.step.clone(),
        }
    }
}

/// De-duplication key of a (resource, operation) pair.
pub fn work_key(resource: &ResourceRef, job_type: &str) -> String {
    format!("{}:{}", resource.queue_key(), job_type)
}

/// One recorded checkpoint of a resumable job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub step_id: Ulid,
    pub job_id: JobId,
    pub step: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub recorded_at: DateTime<Utc>,
}
