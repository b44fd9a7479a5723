#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{
    FnHandler, FnWakeupHandler, HandlerFuture, HandlerResult, JobContext, JobHandler, Wakeup,
    WakeupHandler,
};
use db::{Database, DbConfig, DbError};
use job_core::FrameworkConfig;

/// A fresh in-memory store shared by every process of one test.
pub async fn setup_db() -> Result<Database, DbError> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    db::init(&DbConfig::memory()).await
}

/// Settings with short intervals so tests run quickly.
pub fn fast_config() -> FrameworkConfig {
    FrameworkConfig::default()
        .with_worker_pool_size(4)
        .with_worker_poll_interval(Duration::from_millis(20))
        .with_housekeeper_interval(Duration::from_millis(50))
        .with_join_poll_interval(Duration::from_millis(50))
        .with_process_timeout(Duration::from_secs(2))
}

pub fn handler<F, Fut>(job_type: &str, f: F) -> impl JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler::new(job_type, move |ctx| -> HandlerFuture { Box::pin(f(ctx)) })
}

pub fn wakeup<F, Fut>(name: &str, f: F) -> impl WakeupHandler
where
    F: Fn(JobContext, Wakeup) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnWakeupHandler::new(name, move |ctx, wakeup| -> HandlerFuture {
        Box::pin(f(ctx, wakeup))
    })
}

/// Ordered record of what handlers did.
#[derive(Clone, Default)]
pub struct Log {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}
