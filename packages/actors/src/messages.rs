//! Message types for actor communication.

use db::DbError;
use db::repositories::WorkSubmission;
use job_core::{Job, JobId, JobStatusReport};
use ractor::RpcReplyPort;

use crate::bus::BusError;
use crate::context::JobRequest;

/// Messages for the Dispatcher.
#[derive(Debug)]
pub enum DispatcherMessage {
    /// Record and enqueue a new job.
    Submit {
        request: JobRequest,
        reply: RpcReplyPort<Result<Job, String>>,
    },

    /// Submit resumable work, attaching to unfinished work on the same target.
    SubmitWork {
        request: JobRequest,
        reply: RpcReplyPort<Result<WorkSubmission, String>>,
    },

    /// Get the status of a job.
    GetStatus {
        job_id: JobId,
        reply: RpcReplyPort<Result<JobStatusReport, String>>,
    },

    /// A job finished; wake local parents joined on it.
    ChildCompleted { child_job_id: JobId },

    /// Run a housekeeping sweep now.
    Sweep {
        reply: RpcReplyPort<Result<SweepReport, String>>,
    },

    /// Let idle workers look for work right away.
    WakeWorkers,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Look for one unit of work: a pending wakeup or a ready queue item.
    Poll,

    /// Check if worker is idle.
    IsIdle { reply: RpcReplyPort<bool> },
}

/// Messages for the Housekeeper.
#[derive(Debug)]
pub enum HousekeeperMessage {
    /// Periodic sweep.
    Tick,

    /// Sweep now and report what was done.
    Sweep {
        reply: RpcReplyPort<Result<SweepReport, String>>,
    },
}

/// What one housekeeping sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphaned jobs returned to their queue.
    pub requeued: usize,
    /// Orphaned jobs failed after too many recoveries.
    pub abandoned: usize,
    /// Joins marked as timed out.
    pub expired_joins: usize,
    /// Parents queued for a wakeup delivery.
    pub wakeups_queued: usize,
    /// Waiting items older than the blocked threshold.
    pub blocked_items: usize,
    /// Terminal jobs purged.
    pub expunged: u64,
}

/// Error type for framework operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown wakeup handler: {0}")]
    UnknownWakeupHandler(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Timeout")]
    Timeout,
}
