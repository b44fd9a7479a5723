//! Join repository: "parent waits on child" records and their wakeup state.

use chrono::{DateTime, Utc};
use job_core::{JobId, JobResult, JoinId, JoinRecord, JoinStatus, ProcessId};
use serde::Deserialize;

use crate::{Database, DbError, now_ms};

/// Repository for join records.
#[derive(Clone)]
pub struct JoinRepository {
    db: Database,
}

#[derive(Debug, Deserialize)]
struct JoinIdRow {
    join_id: JoinId,
}

#[derive(Debug, Deserialize)]
struct ParentRow {
    parent_job_id: JobId,
}

impl JoinRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record that the parent waits on the child.
    ///
    /// Joining the same pair twice returns the existing record's id.
    pub async fn join(&self, record: &JoinRecord) -> Result<JoinId, DbError> {
        if let Some(existing) = self.get_for(record.parent_job_id, record.child_job_id).await? {
            return Ok(existing.join_id);
        }

        self.db
            .query("CREATE type::thing('job_join', $join_id) CONTENT $content RETURN NONE")
            .bind(("join_id", record.join_id.to_string()))
            .bind(("content", record.clone()))
            .await?
            .check()?;

        tracing::debug!(
            "Job {} joined {} (wakeup: {})",
            record.parent_job_id,
            record.child_job_id,
            record.wakeup_handler
        );
        Ok(record.join_id)
    }

    pub async fn get(&self, join_id: JoinId) -> Result<Option<JoinRecord>, DbError> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM type::thing('job_join', $join_id)")
            .bind(("join_id", join_id.to_string()))
            .await?;
        let records: Vec<JoinRecord> = response.take(0)?;
        Ok(records.into_iter().next())
    }

    /// The record joining `parent` to `child`, if any.
    pub async fn get_for(&self, parent: JobId, child: JobId) -> Result<Option<JoinRecord>, DbError> {
        let mut response = self
            .db
            .query(
                "SELECT * OMIT id FROM job_join WHERE parent_job_id = $parent_id AND child_job_id = $child_id LIMIT 1",
            )
            .bind(("parent_id", parent.to_string()))
            .bind(("child_id", child.to_string()))
            .await?;
        let records: Vec<JoinRecord> = response.take(0)?;
        Ok(records.into_iter().next())
    }

    /// Withdraw the parent's interest in one child. Idempotent.
    pub async fn disjoin(&self, parent: JobId, child: JobId) -> Result<(), DbError> {
        self.db
            .query("DELETE job_join WHERE parent_job_id = $parent_id AND child_job_id = $child_id RETURN NONE")
            .bind(("parent_id", parent.to_string()))
            .bind(("child_id", child.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Withdraw every join of the parent. Idempotent.
    pub async fn disjoin_all(&self, parent: JobId) -> Result<(), DbError> {
        self.db
            .query("DELETE job_join WHERE parent_job_id = $parent_id RETURN NONE")
            .bind(("parent_id", parent.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Record the child's outcome on every open join waiting on it.
    ///
    /// Returns the number of joins marked.
    pub async fn complete_join(
        &self,
        child: JobId,
        status: JoinStatus,
        result: &JobResult,
        completed_by: &ProcessId,
    ) -> Result<usize, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE job_join
                SET join_status = $status, join_result = $job_result,
                    completed_by = $completed_by, completed_at = $now_ms
                WHERE child_job_id = $child_id AND join_status = NONE
                RETURN join_id
                "#,
            )
            .bind(("status", status.as_str()))
            .bind(("job_result", result.clone()))
            .bind(("completed_by", completed_by.as_str().to_string()))
            .bind(("now_ms", now_ms()))
            .bind(("child_id", child.to_string()))
            .await?;
        let marked: Vec<JoinIdRow> = response.take(0)?;
        Ok(marked.len())
    }

    /// Parents whose join on `child` is completed and not yet delivered,
    /// optionally only those owned by `parent_owner`.
    pub async fn find_ready_to_wake(
        &self,
        child: JobId,
        parent_owner: Option<&ProcessId>,
    ) -> Result<Vec<JobId>, DbError> {
        let query = if parent_owner.is_some() {
            "SELECT parent_job_id FROM job_join WHERE child_job_id = $child_id AND join_status != NONE AND claimed_by = NONE AND parent_owner = $owner"
        } else {
            "SELECT parent_job_id FROM job_join WHERE child_job_id = $child_id AND join_status != NONE AND claimed_by = NONE"
        };

        let mut request = self.db.query(query).bind(("child_id", child.to_string()));
        if let Some(owner) = parent_owner {
            request = request.bind(("owner", owner.as_str().to_string()));
        }

        let mut response = request.await?;
        let rows: Vec<ParentRow> = response.take(0)?;
        let mut parents: Vec<JobId> = rows.into_iter().map(|row| row.parent_job_id).collect();
        parents.sort();
        parents.dedup();
        Ok(parents)
    }

    /// Completed, undelivered joins of one parent, oldest first.
    pub async fn ready_for_parent(&self, parent: JobId) -> Result<Vec<JoinRecord>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM job_join
                WHERE parent_job_id = $parent_id AND join_status != NONE AND claimed_by = NONE
                ORDER BY join_id ASC
                "#,
            )
            .bind(("parent_id", parent.to_string()))
            .await?;
        let records: Vec<JoinRecord> = response.take(0)?;
        Ok(records)
    }

    /// Joins of one parent still waiting on their child.
    pub async fn pending_for_parent(&self, parent: JobId) -> Result<Vec<JoinRecord>, DbError> {
        let mut response = self
            .db
            .query(
                "SELECT * OMIT id FROM job_join WHERE parent_job_id = $parent_id AND join_status = NONE ORDER BY join_id ASC",
            )
            .bind(("parent_id", parent.to_string()))
            .await?;
        let records: Vec<JoinRecord> = response.take(0)?;
        Ok(records)
    }

    /// Poll step of the cross-process wakeup path for `owner`.
    ///
    /// Returns completed, undelivered joins whose next check is due, and
    /// pushes the next check of still-open joins out by their poll interval.
    pub async fn ready_for_process(
        &self,
        owner: &ProcessId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRecord>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM job_join
                WHERE parent_owner = $owner AND join_status != NONE
                    AND claimed_by = NONE AND next_check_at <= $now_ms
                ORDER BY join_id ASC;
                UPDATE job_join
                SET next_check_at = $now_ms + poll_interval_ms
                WHERE parent_owner = $owner AND join_status = NONE AND next_check_at <= $now_ms
                RETURN NONE;
                "#,
            )
            .bind(("owner", owner.as_str().to_string()))
            .bind(("now_ms", now.timestamp_millis()))
            .await?;
        let records: Vec<JoinRecord> = response.take(0)?;
        response.check()?;
        Ok(records)
    }

    /// Open joins whose expiration is at or before `cutoff`.
    pub async fn find_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<JoinId>, DbError> {
        let mut response = self
            .db
            .query(
                "SELECT join_id FROM job_join WHERE join_status = NONE AND expires_at <= $cutoff ORDER BY join_id ASC",
            )
            .bind(("cutoff", cutoff.timestamp_millis()))
            .await?;
        let rows: Vec<JoinIdRow> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.join_id).collect())
    }

    /// Mark an open join as timed out at `now` and due for its wakeup from
    /// `now` on.
    ///
    /// Returns `false` when the join completed, disappeared or is not yet
    /// expired at `now`.
    pub async fn expire(
        &self,
        join_id: JoinId,
        expired_by: &ProcessId,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let now = now.timestamp_millis();
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing('job_join', $join_id)
                SET join_status = "timed_out", join_result = $job_result,
                    completed_by = $completed_by, completed_at = $now_ms, next_check_at = $now_ms
                WHERE join_status = NONE AND expires_at <= $now_ms
                RETURN join_id
                "#,
            )
            .bind(("join_id", join_id.to_string()))
            .bind(("job_result", JobResult::new("join expired before the job finished")))
            .bind(("completed_by", expired_by.as_str().to_string()))
            .bind(("now_ms", now))
            .await?;
        let rows: Vec<JoinIdRow> = response.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Take delivery of a completed join.
    ///
    /// At most one caller across all processes receives the record; the join
    /// is deleted once claimed.
    pub async fn claim_wakeup(
        &self,
        join_id: JoinId,
        claimed_by: &ProcessId,
    ) -> Result<Option<JoinRecord>, DbError> {
        let claimed = self
            .db
            .query(
                r#"
                UPDATE type::thing('job_join', $join_id)
                SET claimed_by = $owner
                WHERE claimed_by = NONE AND join_status != NONE
                RETURN join_id
                "#,
            )
            .bind(("join_id", join_id.to_string()))
            .bind(("owner", claimed_by.as_str().to_string()))
            .await
            .map_err(DbError::from)
            .and_then(|mut response| response.take::<Vec<JoinIdRow>>(0).map_err(DbError::from));

        let claimed = match claimed {
            Ok(rows) => !rows.is_empty(),
            Err(err) if err.is_conflict() => {
                tracing::debug!("Wakeup {} claimed concurrently: {}", join_id, err);
                false
            }
            Err(err) => return Err(err),
        };
        if !claimed {
            return Ok(None);
        }

        let record = self.get(join_id).await?;
        self.db
            .query("DELETE type::thing('job_join', $join_id) RETURN NONE")
            .bind(("join_id", join_id.to_string()))
            .await?
            .check()?;
        Ok(record)
    }
}
