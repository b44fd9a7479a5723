//! Actor system for job execution.
//!
//! This crate provides the Ractor-based runtime of one management-server
//! process: a dispatcher owning a pool of workers and a housekeeper, all
//! sharing one job store with the other processes.
//!
//! # Architecture
//!
//! - `Dispatcher` - Top-level actor; accepts submissions and routes local wakeups
//! - `WorkerActor` - Dequeues sync queue items and delivers join wakeups
//! - `Housekeeper` - Heartbeats, orphan recovery, join expiry and retention
//! - `MessageBus` - In-process pub/sub for job events
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobHandlerRegistry, JobRequest, WakeupRegistry, start_dispatcher};
//!
//! let mut handlers = JobHandlerRegistry::new();
//! handlers.register(actors::job_handler!("echo", |ctx| {
//!     Ok(HandlerOutcome::Complete(JobResult::new("done")))
//! }));
//!
//! let dispatcher = start_dispatcher(db, config, handlers, WakeupRegistry::new(), pid).await?;
//! let job_id = dispatcher.submit(JobRequest::new("echo", json!({}))).await?;
//! dispatcher.wait_for(job_id, Duration::from_secs(5)).await?;
//! ```

pub mod bus;
mod context;
mod dispatcher;
mod handler;
mod housekeeper;
mod join_coordinator;
mod messages;
mod services;
mod worker_actor;

pub use bus::{BusError, MessageBus, Published, Subscriber};
pub use context::{JobContext, JobRequest};
pub use dispatcher::{Dispatcher, DispatcherHandle, start_dispatcher};
pub use handler::{
    FnHandler, FnWakeupHandler, HandlerFuture, HandlerOutcome, HandlerResult, JobHandler,
    JobHandlerRegistry, Wakeup, WakeupHandler, WakeupRegistry,
};
pub use housekeeper::Housekeeper;
pub use join_coordinator::JoinCoordinator;
pub use messages::{
    DispatchError, DispatcherMessage, HousekeeperMessage, SweepReport, WorkerMessage,
};
pub use worker_actor::WorkerActor;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
