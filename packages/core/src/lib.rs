//! Core domain types for the job execution framework.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and JobResult for units of work
//! - SyncQueueItem and the dequeue policy for per-resource queues
//! - JoinRecord for jobs waiting on other jobs
//! - Events and bus subjects for in-process observers
//! - FrameworkConfig for process settings

mod config;
pub mod events;
mod job;
mod join;
mod queue;
mod resource;

pub use config::{ConfigError, FrameworkConfig};
pub use events::{JobEvent, subjects};
pub use job::{Job, JobId, JobResult, JobStatus, JobStatusReport, StepCheckpoint, next_ulid, work_key};
pub use join::{JoinId, JoinRecord, JoinStatus, MAX_POLL_INTERVAL_MS};
pub use queue::{SyncItemId, SyncQueueItem, dequeue_candidates};
pub use resource::{ProcessId, ResourceRef};
