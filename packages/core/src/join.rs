//! Join records: one job waiting on the completion of another.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{JobId, JobResult, JobStatus, ProcessId, ResourceRef, job::next_ulid};

/// Unique identifier for a join record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinId(pub Ulid);

impl JoinId {
    pub fn new() -> Self {
        Self(next_ulid())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JoinId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JoinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome recorded on a join once the wait is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    /// The joined job succeeded.
    Succeeded,
    /// The joined job failed.
    Failed,
    /// The expiration elapsed before the joined job finished.
    TimedOut,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStatus::Succeeded => "succeeded",
            JoinStatus::Failed => "failed",
            JoinStatus::TimedOut => "timed_out",
        }
    }

    /// Join outcome for a terminal job status; `None` while the job still runs.
    pub fn from_job_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Succeeded => Some(JoinStatus::Succeeded),
            JobStatus::Failed => Some(JoinStatus::Failed),
            JobStatus::Queued | JobStatus::InProgress => None,
        }
    }
}

impl std::fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// "Parent job is waiting on child job", with its wakeup policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRecord {
    pub join_id: JoinId,
    pub parent_job_id: JobId,
    pub child_job_id: JobId,
    /// Process that owns the parent and receives the wakeup.
    pub parent_owner: ProcessId,
    /// Process that owns the child, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_owner: Option<ProcessId>,
    pub poll_interval_ms: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Queue key the parent was serialized on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    /// Registered wakeup handler to invoke on the parent side.
    pub wakeup_handler: String,
    /// Opaque dispatch target handed to the wakeup handler.
    #[serde(default)]
    pub wakeup_target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_status: Option<JoinStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<ProcessId>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    /// Process that claimed delivery of the wakeup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<ProcessId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Earliest time the housekeeper polls this join again.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub next_check_at: DateTime<Utc>,
}

/// Longest poll interval a join keeps.
///
/// The store adds it to the current unix-ms timestamp, which must stay a
/// representable date.
pub const MAX_POLL_INTERVAL_MS: u64 = (i64::MAX / 4) as u64;

impl JoinRecord {
    /// A join with a one second poll interval that never expires on its own.
    pub fn new(parent_job_id: JobId, child_job_id: JobId, parent_owner: ProcessId) -> Self {
        let now = Utc::now();
        Self {
            join_id: JoinId::new(),
            parent_job_id,
            child_job_id,
            parent_owner,
            child_owner: None,
            poll_interval_ms: 1_000,
            expires_at: DateTime::<Utc>::MAX_UTC,
            resource: None,
            wakeup_handler: String::new(),
            wakeup_target: String::new(),
            join_status: None,
            join_result: None,
            completed_by: None,
            completed_at: None,
            claimed_by: None,
            created_at: now,
            next_check_at: now,
        }
    }

    pub fn with_child_owner(mut self, owner: Option<ProcessId>) -> Self {
        self.child_owner = owner;
        self
    }

    /// Check the join every `interval`, capped at [`MAX_POLL_INTERVAL_MS`].
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis())
            .unwrap_or(u64::MAX)
            .min(MAX_POLL_INTERVAL_MS);
        self.next_check_at = chrono::Duration::from_std(interval)
            .ok()
            .and_then(|delta| self.created_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self
    }

    /// Expire `expiration` after creation.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(expiration)
            .ok()
            .and_then(|delta| self.created_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self
    }

    pub fn with_resource(mut self, resource: Option<ResourceRef>) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_wakeup(mut self, handler: impl Into<String>, target: impl Into<String>) -> Self {
        self.wakeup_handler = handler.into();
        self.wakeup_target = target.into();
        self
    }

    /// The joined job finished or the join timed out.
    pub fn is_completed(&self) -> bool {
        self.join_status.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
