//! Repository implementations for database operations.
//!
//! Every repository owns a clone of the [`Database`](crate::Database) handle.
//! Records are read with `OMIT id` so rows deserialize straight into the
//! domain types; each row carries its own ULID key field.

mod job_repo;
mod join_repo;
mod process_repo;
mod sync_queue_repo;

pub use job_repo::{JobFilter, JobRepository, WorkSubmission};
pub use join_repo::JoinRepository;
pub use process_repo::{ProcessRecord, ProcessRepository};
pub use sync_queue_repo::SyncQueueRepository;

use serde::Deserialize;

/// Projection returned by compare-and-set updates.
#[derive(Debug, Deserialize)]
struct Versioned {
    #[allow(dead_code)]
    version: u64,
}

/// Compare-and-set attempts against one record before giving up.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Run a compare-and-set update whose last statement projects `RETURN version`.
///
/// Returns whether a row was changed. A transaction conflict with another
/// writer counts as a lost race.
async fn cas_applied(
    query: surrealdb::method::Query<'_, surrealdb::engine::any::Any>,
) -> Result<bool, crate::DbError> {
    let outcome = async {
        let mut response = query.await?;
        let last = response.num_statements().saturating_sub(1);
        let rows: Vec<Versioned> = response.take(last)?;
        Ok::<_, crate::DbError>(!rows.is_empty())
    }
    .await;

    match outcome {
        Err(err) if err.is_conflict() => {
            tracing::debug!("Compare-and-set lost to a concurrent writer: {}", err);
            Ok(false)
        }
        other => other,
    }
}
