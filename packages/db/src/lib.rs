//! SurrealDB integration for the job execution framework.
//!
//! This crate provides database connectivity and repositories for the
//! shared store every management-server process coordinates through:
//! jobs, per-resource sync queues, joins and process heartbeats.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use schema::init_schema;

/// Connect to the database and make sure the schema exists.
///
/// This should be called once at application startup; clone the returned
/// handle into every repository.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}

/// Current time as stored in the database.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
