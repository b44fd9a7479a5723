//! Job repository: the durable job records and their lifecycle transitions.

use chrono::{DateTime, Utc};
use job_core::{
    Job, JobId, JobResult, JobStatus, JobStatusReport, ProcessId, ResourceRef, StepCheckpoint,
    next_ulid,
};
use serde::{Deserialize, Serialize};

use super::{MAX_CAS_ATTEMPTS, cas_applied};
use crate::{Database, DbError, now_ms};

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub resource: Option<ResourceRef>,
    pub owner: Option<ProcessId>,
    pub limit: Option<usize>,
}

/// Outcome of submitting resumable work.
#[derive(Debug, Clone)]
pub struct WorkSubmission {
    pub job: Job,
    /// An unfinished job for the same work already existed and was returned.
    pub attached: bool,
}

#[derive(Debug, Deserialize)]
struct JobIdRow {
    job_id: JobId,
}

/// Marker row owning a work key while its job is unfinished.
#[derive(Debug, Serialize)]
struct WorkClaim {
    work_key: String,
    job_id: JobId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a job record as given.
    pub async fn create(&self, job: &Job) -> Result<(), DbError> {
        self.db
            .query("CREATE type::thing('job', $job_id) CONTENT $content RETURN NONE")
            .bind(("job_id", job.job_id.to_string()))
            .bind(("content", job.clone()))
            .await?
            .check()?;

        tracing::debug!("Created job {} ({})", job.job_id, job.job_type);
        Ok(())
    }

    /// Create a QUEUED job for `job_type`.
    pub async fn submit(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        resource: Option<ResourceRef>,
    ) -> Result<Job, DbError> {
        let job = Job::new(job_type, payload).with_resource(resource);
        self.create(&job).await?;
        Ok(job)
    }

    /// Create a resumable work job unless unfinished work with the same
    /// (resource, job type) already exists, in which case that job is returned.
    pub async fn submit_work(&self, job: Job) -> Result<WorkSubmission, DbError> {
        let Some(work_key) = job.work_key.clone() else {
            self.create(&job).await?;
            return Ok(WorkSubmission {
                job,
                attached: false,
            });
        };

        // The job exists before its claim, so a claim always points at a real job.
        self.create(&job).await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let claimed = self
                .db
                .query("CREATE type::thing('work_claim', $key) CONTENT $claim RETURN NONE")
                .bind(("key", work_key.clone()))
                .bind((
                    "claim",
                    WorkClaim {
                        work_key: work_key.clone(),
                        job_id: job.job_id,
                        created_at: Utc::now(),
                    },
                ))
                .await
                .and_then(|response| response.check());

            let claim_error = match claimed {
                Ok(_) => {
                    return Ok(WorkSubmission {
                        job,
                        attached: false,
                    });
                }
                Err(err) => DbError::from(err),
            };

            let Some(holder) = self.claim_holder(&work_key).await? else {
                if claim_error.is_conflict() {
                    continue;
                }
                self.delete(job.job_id).await?;
                return Err(claim_error);
            };

            match self.find(holder).await? {
                Some(existing) if !existing.status.is_terminal() => {
                    self.delete(job.job_id).await?;
                    tracing::info!(
                        "Work {} already running as job {}, attaching",
                        work_key,
                        existing.job_id
                    );
                    return Ok(WorkSubmission {
                        job: existing,
                        attached: true,
                    });
                }
                _ => {
                    // Stale claim of a finished or purged job.
                    self.release_work_claim(holder).await?;
                }
            }
        }

        self.delete(job.job_id).await?;
        Err(DbError::Conflict(format!(
            "Could not claim work key {}",
            work_key
        )))
    }

    async fn claim_holder(&self, work_key: &str) -> Result<Option<JobId>, DbError> {
        let mut response = self
            .db
            .query("SELECT job_id FROM type::thing('work_claim', $key)")
            .bind(("key", work_key.to_string()))
            .await?;
        let rows: Vec<JobIdRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(|row| row.job_id))
    }

    /// Drop the work claim held by a job, if any.
    pub async fn release_work_claim(&self, job_id: JobId) -> Result<(), DbError> {
        self.db
            .query("DELETE work_claim WHERE job_id = $job_id RETURN NONE")
            .bind(("job_id", job_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Unfinished work job with the given work key.
    pub async fn find_pending_work(&self, work_key: &str) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM job
                WHERE work_key = $key AND status IN ["queued", "in_progress"]
                ORDER BY job_id ASC
                LIMIT 1
                "#,
            )
            .bind(("key", work_key.to_string()))
            .await?;
        let jobs: Vec<Job> = response.take(0)?;
        Ok(jobs.into_iter().next())
    }

    pub async fn find(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM type::thing('job', $job_id)")
            .bind(("job_id", id.to_string()))
            .await?;
        let jobs: Vec<Job> = response.take(0)?;
        Ok(jobs.into_iter().next())
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Status and, once terminal, result of a job.
    pub async fn status(&self, id: JobId) -> Result<JobStatusReport, DbError> {
        Ok(self.get(id).await?.report())
    }

    /// List jobs with optional filtering, oldest first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DbError> {
        let mut conditions = Vec::new();
        let mut bindings: Vec<(&'static str, serde_json::Value)> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = $status");
            bindings.push(("status", serde_json::json!(status.as_str())));
        }

        if let Some(job_type) = &filter.job_type {
            conditions.push("job_type = $job_type");
            bindings.push(("job_type", serde_json::json!(job_type)));
        }

        if let Some(resource) = &filter.resource {
            conditions.push("resource.resource_type = $resource_type");
            conditions.push("resource.resource_id = $resource_id");
            bindings.push(("resource_type", serde_json::json!(resource.resource_type)));
            bindings.push(("resource_id", serde_json::json!(resource.resource_id)));
        }

        if let Some(owner) = &filter.owner {
            conditions.push("owner = $owner");
            bindings.push(("owner", serde_json::json!(owner.as_str())));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let query = format!(
            "SELECT * OMIT id FROM job {} ORDER BY job_id ASC {}",
            where_clause, limit_clause
        );

        let mut result = self.db.query(query);

        for (name, value) in bindings {
            result = result.bind((name, value));
        }

        let mut response = result.await?;
        let jobs: Vec<Job> = response.take(0)?;

        Ok(jobs)
    }

    /// Every job currently IN_PROGRESS, whichever process owns it.
    pub async fn in_progress(&self) -> Result<Vec<Job>, DbError> {
        self.list(JobFilter {
            status: Some(JobStatus::InProgress),
            ..Default::default()
        })
        .await
    }

    /// QUEUED -> IN_PROGRESS for `owner`.
    ///
    /// Returns `false` without changing anything when the job is no longer
    /// QUEUED or another writer got there first.
    pub async fn mark_running(&self, id: JobId, owner: &ProcessId) -> Result<bool, DbError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(job) = self.find(id).await? else {
                return Ok(false);
            };
            if job.status != JobStatus::Queued {
                return Ok(false);
            }

            let applied = cas_applied(
                self.db
                    .query(
                        r#"
                        UPDATE type::thing('job', $job_id)
                        SET status = "in_progress", owner = $owner,
                            updated_at = $now_ms, version += 1
                        WHERE status = "queued" AND version = $version
                        RETURN version
                        "#,
                    )
                    .bind(("job_id", id.to_string()))
                    .bind(("owner", owner.as_str().to_string()))
                    .bind(("now_ms", now_ms()))
                    .bind(("version", job.version)),
            )
            .await?;

            if applied {
                tracing::debug!("Job {} claimed by {}", id, owner);
                return Ok(true);
            }
            tracing::debug!("Lost claim race on job {}, re-reading", id);
        }
        Ok(false)
    }

    /// Record a checkpoint for an IN_PROGRESS job and append it to the history.
    pub async fn update_step(&self, id: JobId, step: &str) -> Result<(), DbError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.get(id).await?;
            if job.status != JobStatus::InProgress {
                return Err(DbError::InvalidTransition(format!(
                    "Job {} is {}, steps are only recorded while in progress",
                    id, job.status
                )));
            }

            let applied = cas_applied(
                self.db
                    .query(
                        r#"
                        UPDATE type::thing('job', $job_id)
                        SET step = $step, updated_at = $now_ms, version += 1
                        WHERE status = "in_progress" AND version = $version
                        RETURN version
                        "#,
                    )
                    .bind(("job_id", id.to_string()))
                    .bind(("step", step.to_string()))
                    .bind(("now_ms", now_ms()))
                    .bind(("version", job.version)),
            )
            .await?;

            if applied {
                let checkpoint = StepCheckpoint {
                    step_id: next_ulid(),
                    job_id: id,
                    step: step.to_string(),
                    recorded_at: Utc::now(),
                };
                self.db
                    .query("CREATE job_step CONTENT $checkpoint RETURN NONE")
                    .bind(("checkpoint", checkpoint))
                    .await?
                    .check()?;
                return Ok(());
            }
        }

        Err(DbError::Conflict(format!(
            "Step update of job {} kept racing with other writers",
            id
        )))
    }

    /// Checkpoints recorded for a job, oldest first.
    pub async fn step_history(&self, id: JobId) -> Result<Vec<StepCheckpoint>, DbError> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM job_step WHERE job_id = $job_id ORDER BY step_id ASC")
            .bind(("job_id", id.to_string()))
            .await?;
        let steps: Vec<StepCheckpoint> = response.take(0)?;
        Ok(steps)
    }

    /// Ask the handler of an unfinished job to stop.
    ///
    /// Returns `false` when the job is already terminal.
    pub async fn request_cancel(&self, id: JobId) -> Result<bool, DbError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.get(id).await?;
            if job.status.is_terminal() {
                return Ok(false);
            }
            if job.cancel_requested {
                return Ok(true);
            }

            let applied = cas_applied(
                self.db
                    .query(
                        r#"
                        UPDATE type::thing('job', $job_id)
                        SET cancel_requested = true, updated_at = $now_ms, version += 1
                        WHERE version = $version
                        RETURN version
                        "#,
                    )
                    .bind(("job_id", id.to_string()))
                    .bind(("now_ms", now_ms()))
                    .bind(("version", job.version)),
            )
            .await?;

            if applied {
                tracing::info!("Cancellation requested for job {}", id);
                return Ok(true);
            }
        }

        Err(DbError::Conflict(format!(
            "Cancellation of job {} kept racing with other writers",
            id
        )))
    }

    /// IN_PROGRESS -> terminal `status` with `result`.
    ///
    /// Returns `true` when this call made the transition and `false` when the
    /// job already had exactly this terminal status. A different terminal
    /// status is a [`DbError::Conflict`].
    pub async fn complete(
        &self,
        id: JobId,
        status: JobStatus,
        result: &JobResult,
        completed_by: &ProcessId,
    ) -> Result<bool, DbError> {
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "{} is not a terminal status",
                status
            )));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.get(id).await?;
            if job.status == status {
                return Ok(false);
            }
            if job.status.is_terminal() {
                return Err(DbError::Conflict(format!(
                    "Job {} already completed as {}",
                    id, job.status
                )));
            }
            if !job.status.can_transition_to(status) {
                return Err(DbError::InvalidTransition(format!(
                    "Job {} cannot move from {} to {}",
                    id, job.status, status
                )));
            }

            let applied = cas_applied(
                self.db
                    .query(
                        r#"
                        UPDATE type::thing('job', $job_id)
                        SET status = $status, result = $job_result, completed_by = $completed_by,
                            updated_at = $now_ms, version += 1
                        WHERE status = "in_progress" AND version = $version
                        RETURN version
                        "#,
                    )
                    .bind(("job_id", id.to_string()))
                    .bind(("status", status.as_str()))
                    .bind(("job_result", result.clone()))
                    .bind(("completed_by", completed_by.as_str().to_string()))
                    .bind(("now_ms", now_ms()))
                    .bind(("version", job.version)),
            )
            .await?;

            if applied {
                tracing::info!("Job {} -> {}", id, status);
                return Ok(true);
            }
        }

        Err(DbError::Conflict(format!(
            "Completion of job {} kept racing with other writers",
            id
        )))
    }

    /// Return an IN_PROGRESS job of a dead process to QUEUED.
    ///
    /// `job` must be the record as last read; the update only applies if it
    /// is still at that version.
    pub async fn requeue_orphan(&self, job: &Job) -> Result<bool, DbError> {
        cas_applied(
            self.db
                .query(
                    r#"
                    UPDATE type::thing('job', $job_id)
                    SET status = "queued", owner = NONE, recovery_attempts += 1,
                        updated_at = $now_ms, version += 1
                    WHERE status = "in_progress" AND version = $version
                    RETURN version
                    "#,
                )
                .bind(("job_id", job.job_id.to_string()))
                .bind(("now_ms", now_ms()))
                .bind(("version", job.version)),
        )
        .await
    }

    /// Delete a job and its step history.
    pub async fn delete(&self, id: JobId) -> Result<(), DbError> {
        self.db
            .query(
                r#"
                DELETE type::thing('job', $job_id) RETURN NONE;
                DELETE job_step WHERE job_id = $job_id RETURN NONE;
                "#,
            )
            .bind(("job_id", id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Delete terminal jobs last updated before `cutoff`, with their step
    /// history and work claims. Returns the number of jobs removed.
    pub async fn expunge(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT job_id FROM job
                WHERE status IN ["succeeded", "failed"] AND updated_at < $cutoff
                "#,
            )
            .bind(("cutoff", cutoff.timestamp_millis()))
            .await?;
        let rows: Vec<JobIdRow> = response.take(0)?;

        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = rows.iter().map(|row| row.job_id.to_string()).collect();
        let count = ids.len() as u64;

        self.db
            .query(
                r#"
                DELETE job WHERE job_id IN $ids RETURN NONE;
                DELETE job_step WHERE job_id IN $ids RETURN NONE;
                DELETE work_claim WHERE job_id IN $ids RETURN NONE;
                "#,
            )
            .bind(("ids", ids))
            .await?
            .check()?;

        tracing::info!("Expunged {} jobs finished before {}", count, cutoff);
        Ok(count)
    }
}
