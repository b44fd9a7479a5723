//! Job and wakeup handler traits and their registries.

use job_core::{JobId, JobResult, JoinRecord, JoinStatus};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::JobContext;

/// What a handler decided about its job.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The job succeeded with this result.
    Complete(JobResult),
    /// The job failed with this message.
    Fail(String),
    /// The job waits on its joins and stays in progress.
    Suspend,
}

/// Result type for job and wakeup handlers. `Err` fails the job.
pub type HandlerResult = Result<HandlerOutcome, String>;

/// Future type for async handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of a specific type are processed.
/// A handler that spawns child jobs joins them through the context and
/// returns [`HandlerOutcome::Suspend`]; it is resumed through a
/// [`WakeupHandler`] once a join completes or times out.
pub trait JobHandler: Send + Sync + 'static {
    /// The job type this handler processes.
    fn job_type(&self) -> &str;

    /// Process a job and return the outcome.
    fn handle(&self, ctx: JobContext) -> HandlerFuture;
}

/// A completed or timed out join, handed to the parent's wakeup handler.
#[derive(Debug, Clone)]
pub struct Wakeup {
    pub join: JoinRecord,
}

impl Wakeup {
    pub fn child_job_id(&self) -> JobId {
        self.join.child_job_id
    }

    /// How the wait ended. Defaults to timed out for records that carry none.
    pub fn status(&self) -> JoinStatus {
        self.join.join_status.unwrap_or(JoinStatus::TimedOut)
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.join.join_result.as_ref()
    }

    /// Opaque dispatch target given at join time.
    pub fn target(&self) -> &str {
        &self.join.wakeup_target
    }
}

/// Trait for wakeup handlers, looked up by name when a join fires.
pub trait WakeupHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn on_wakeup(&self, ctx: JobContext, wakeup: Wakeup) -> HandlerFuture;
}

/// Registry for job handlers.
///
/// Maps job types to their handlers for dynamic dispatch.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        let job_type = handler.job_type().to_string();
        self.handlers.insert(job_type, Arc::new(handler));
    }

    /// Get a handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a handler exists for a job type.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// List all registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Registry for wakeup handlers, keyed by name.
#[derive(Default)]
pub struct WakeupRegistry {
    handlers: HashMap<String, Arc<dyn WakeupHandler>>,
}

impl WakeupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: WakeupHandler>(&mut self, handler: H) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WakeupHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    job_type: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(job_type: impl Into<String>, handler: F) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn handle(&self, ctx: JobContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

/// A function-based wakeup handler.
pub struct FnWakeupHandler<F>
where
    F: Fn(JobContext, Wakeup) -> HandlerFuture + Send + Sync + 'static,
{
    name: String,
    handler: F,
}

impl<F> FnWakeupHandler<F>
where
    F: Fn(JobContext, Wakeup) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> WakeupHandler for FnWakeupHandler<F>
where
    F: Fn(JobContext, Wakeup) -> HandlerFuture + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_wakeup(&self, ctx: JobContext, wakeup: Wakeup) -> HandlerFuture {
        (self.handler)(ctx, wakeup)
    }
}

/// Helper macro for creating job handlers from async closures.
#[macro_export]
macro_rules! job_handler {
    ($job_type:expr, |$ctx:ident| $body:expr) => {
        $crate::FnHandler::new($job_type, |$ctx: $crate::JobContext| {
            Box::pin(async move {
                let result: $crate::HandlerResult = $body;
                result
            })
        })
    };
}

/// Helper macro for creating wakeup handlers from async closures.
#[macro_export]
macro_rules! wakeup_handler {
    ($name:expr, |$ctx:ident, $wakeup:ident| $body:expr) => {
        $crate::FnWakeupHandler::new($name, |$ctx: $crate::JobContext, $wakeup: $crate::Wakeup| {
            Box::pin(async move {
                let result: $crate::HandlerResult = $body;
                result
            })
        })
    };
}
