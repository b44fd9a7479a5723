//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes. Safe to run from every
/// process sharing the store.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(SYNC_QUEUE_SCHEMA).await?.check()?;
    db.query(JOIN_SCHEMA).await?.check()?;
    db.query(PROCESS_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job, step history and work claim tables.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_id ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_type ON job FIELDS job_type;
DEFINE INDEX IF NOT EXISTS job_work_key ON job FIELDS work_key;
DEFINE INDEX IF NOT EXISTS job_updated ON job FIELDS updated_at;

-- Checkpoint history of resumable jobs
DEFINE TABLE IF NOT EXISTS job_step SCHEMALESS;
DEFINE INDEX IF NOT EXISTS job_step_job ON job_step FIELDS job_id;

-- One row per (resource, job type) with a live work job, keyed by work key
DEFINE TABLE IF NOT EXISTS work_claim SCHEMALESS;
DEFINE INDEX IF NOT EXISTS work_claim_job ON work_claim FIELDS job_id;
"#;

/// Per-resource sync queue items.
const SYNC_QUEUE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS sync_queue_item SCHEMALESS;

DEFINE INDEX IF NOT EXISTS sync_item_id ON sync_queue_item FIELDS item_id UNIQUE;
DEFINE INDEX IF NOT EXISTS sync_item_key ON sync_queue_item FIELDS queue_key, item_id;
DEFINE INDEX IF NOT EXISTS sync_item_job ON sync_queue_item FIELDS job_id;

-- One gate row per queue key, versioned on every enqueue and claim
DEFINE TABLE IF NOT EXISTS sync_queue SCHEMALESS;
"#;

/// Join records between parent and child jobs.
const JOIN_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_join SCHEMALESS;

DEFINE INDEX IF NOT EXISTS join_id ON job_join FIELDS join_id UNIQUE;
DEFINE INDEX IF NOT EXISTS join_parent ON job_join FIELDS parent_job_id;
DEFINE INDEX IF NOT EXISTS join_child ON job_join FIELDS child_job_id;
DEFINE INDEX IF NOT EXISTS join_owner ON job_join FIELDS parent_owner;
DEFINE INDEX IF NOT EXISTS join_expires ON job_join FIELDS expires_at;
"#;

/// Management-server process heartbeats.
const PROCESS_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS mgmt_process SCHEMALESS;

DEFINE INDEX IF NOT EXISTS process_heartbeat ON mgmt_process FIELDS heartbeat_at;
"#;
