//! Management server process.
//!
//! Connects to the shared job store, starts a dispatcher with the built-in
//! job types and runs until interrupted. Settings come from `JOBS_*`
//! environment variables, log filtering from `RUST_LOG`.

use actors::start_dispatcher;
use db::DbConfig;
use job_core::{FrameworkConfig, ProcessId};
use tracing_subscriber::EnvFilter;

mod handlers;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = FrameworkConfig::from_env()?;
    let db_config = DbConfig::from_env();
    let db = db::init(&db_config).await?;

    let process_id = ProcessId::generate();
    let (handlers, wakeups) = handlers::registries();
    tracing::info!(
        "Starting {} against {} ({} workers)",
        process_id,
        db_config.endpoint,
        config.worker_pool_size
    );
    let dispatcher = start_dispatcher(db, config, handlers, wakeups, process_id).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    dispatcher.shutdown().await?;

    Ok(())
}
