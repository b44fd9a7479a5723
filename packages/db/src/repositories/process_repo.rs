//! Process repository: heartbeats of the management-server processes.

use chrono::{DateTime, Utc};
use job_core::ProcessId;
use serde::{Deserialize, Serialize};

use crate::{Database, DbError, now_ms};

/// Liveness row of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
struct ProcessIdRow {
    process_id: ProcessId,
}

/// Repository for process heartbeats.
#[derive(Clone)]
pub struct ProcessRepository {
    db: Database,
}

impl ProcessRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Announce a starting process.
    pub async fn register(&self, process_id: &ProcessId) -> Result<(), DbError> {
        let now = Utc::now();
        self.register_at(process_id, now).await
    }

    /// Register with an explicit heartbeat time.
    pub async fn register_at(
        &self,
        process_id: &ProcessId,
        heartbeat_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let record = ProcessRecord {
            process_id: process_id.clone(),
            started_at: heartbeat_at,
            heartbeat_at,
            stopped: false,
        };

        self.db
            .query("UPSERT type::thing('mgmt_process', $process_id) CONTENT $content RETURN NONE")
            .bind(("process_id", process_id.as_str().to_string()))
            .bind(("content", record))
            .await?
            .check()?;

        tracing::info!("Registered process {}", process_id);
        Ok(())
    }

    /// Refresh the heartbeat of a running process.
    pub async fn heartbeat(&self, process_id: &ProcessId) -> Result<(), DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing('mgmt_process', $process_id)
                SET heartbeat_at = $now_ms, stopped = false
                RETURN process_id
                "#,
            )
            .bind(("process_id", process_id.as_str().to_string()))
            .bind(("now_ms", now_ms()))
            .await?;
        let rows: Vec<ProcessIdRow> = response.take(0)?;

        if rows.is_empty() {
            tracing::warn!("Process row of {} vanished, registering again", process_id);
            self.register(process_id).await?;
        }
        Ok(())
    }

    pub async fn get(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>, DbError> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM type::thing('mgmt_process', $process_id)")
            .bind(("process_id", process_id.as_str().to_string()))
            .await?;
        let records: Vec<ProcessRecord> = response.take(0)?;
        Ok(records.into_iter().next())
    }

    /// Processes that are running and sent a heartbeat at or after `cutoff`.
    pub async fn live_processes(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessId>, DbError> {
        let mut response = self
            .db
            .query("SELECT process_id FROM mgmt_process WHERE stopped = false AND heartbeat_at >= $cutoff")
            .bind(("cutoff", cutoff.timestamp_millis()))
            .await?;
        let rows: Vec<ProcessIdRow> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.process_id).collect())
    }

    /// Record a graceful shutdown; the process is no longer considered live.
    pub async fn mark_stopped(&self, process_id: &ProcessId) -> Result<(), DbError> {
        self.db
            .query("UPDATE type::thing('mgmt_process', $process_id) SET stopped = true RETURN NONE")
            .bind(("process_id", process_id.as_str().to_string()))
            .await?
            .check()?;

        tracing::info!("Process {} stopped", process_id);
        Ok(())
    }
}
