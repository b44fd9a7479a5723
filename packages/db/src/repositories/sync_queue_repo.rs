//! Sync queue repository: per-resource FIFO queues shared by every process.
//!
//! Every queue key has a gate row in `sync_queue` whose `version` moves on
//! each enqueue and each claim. A claim commits only if the gate still has
//! the version its snapshot of the queue was taken under, so the
//! exclusivity check and the claim are one atomic step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use job_core::{JobId, ProcessId, ResourceRef, SyncItemId, SyncQueueItem, dequeue_candidates};
use serde::Deserialize;

use super::{MAX_CAS_ATTEMPTS, cas_applied};
use crate::{Database, DbError, now_ms};

/// Repository for sync queue items.
#[derive(Clone)]
pub struct SyncQueueRepository {
    db: Database,
}

/// Attempts to bump a contended queue gate while enqueueing.
const MAX_ENQUEUE_ATTEMPTS: usize = 16;

#[derive(Debug, Deserialize)]
struct GateRow {
    version: u64,
}

impl SyncQueueRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an item for `job_id` to the queue of `resource`.
    pub async fn enqueue(
        &self,
        resource: &ResourceRef,
        job_id: JobId,
        job_type: &str,
        exclusive: bool,
    ) -> Result<SyncItemId, DbError> {
        let item = SyncQueueItem::new(resource.clone(), job_id, job_type, exclusive);
        let item_id = item.item_id;

        for _ in 0..MAX_ENQUEUE_ATTEMPTS {
            let outcome = self
                .db
                .query(
                    r#"
                    BEGIN TRANSACTION;
                    UPSERT type::thing('sync_queue', $key)
                        SET queue_key = $key, version = (version OR 0) + 1, updated_at = $now_ms
                        RETURN NONE;
                    CREATE type::thing('sync_queue_item', $item_id) CONTENT $content RETURN NONE;
                    COMMIT TRANSACTION;
                    "#,
                )
                .bind(("key", item.queue_key.clone()))
                .bind(("now_ms", now_ms()))
                .bind(("item_id", item_id.to_string()))
                .bind(("content", item.clone()))
                .await
                .map_err(DbError::from)
                .and_then(|response| response.check().map_err(DbError::from));

            match outcome {
                Ok(_) => {
                    tracing::debug!(
                        "Enqueued job {} on {} (exclusive: {})",
                        job_id,
                        resource,
                        exclusive
                    );
                    return Ok(item_id);
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!("Enqueue on {} raced another writer: {}", item.queue_key, err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(DbError::Conflict(format!(
            "Could not enqueue job {} on {}",
            job_id, item.queue_key
        )))
    }

    pub async fn get(&self, item_id: SyncItemId) -> Result<Option<SyncQueueItem>, DbError> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM type::thing('sync_queue_item', $item_id)")
            .bind(("item_id", item_id.to_string()))
            .await?;
        let items: Vec<SyncQueueItem> = response.take(0)?;
        Ok(items.into_iter().next())
    }

    /// All items of one queue key in enqueue order.
    pub async fn items_for_key(&self, queue_key: &str) -> Result<Vec<SyncQueueItem>, DbError> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM sync_queue_item WHERE queue_key = $key ORDER BY item_id ASC")
            .bind(("key", queue_key.to_string()))
            .await?;
        let items: Vec<SyncQueueItem> = response.take(0)?;
        Ok(items)
    }

    /// Queue keys with an item of the given job types that may start now,
    /// ordered by their oldest such item.
    ///
    /// Keys held by an active exclusive item, or whose next item waits behind
    /// one, are skipped so they cannot crowd out runnable keys.
    pub async fn ready_keys(&self, job_types: &[String], limit: usize) -> Result<Vec<String>, DbError> {
        if job_types.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut response = self
            .db
            .query("SELECT * OMIT id FROM sync_queue_item ORDER BY item_id ASC")
            .await?;
        let items: Vec<SyncQueueItem> = response.take(0)?;

        let mut queues: HashMap<String, Vec<SyncQueueItem>> = HashMap::new();
        for item in items {
            queues.entry(item.queue_key.clone()).or_default().push(item);
        }

        let mut ready: Vec<(SyncItemId, String)> = queues
            .iter()
            .filter_map(|(key, items)| {
                dequeue_candidates(items)
                    .into_iter()
                    .find(|item| job_types.contains(&item.job_type))
                    .map(|item| (item.item_id, key.clone()))
            })
            .collect();
        ready.sort();
        ready.truncate(limit);
        Ok(ready.into_iter().map(|(_, key)| key).collect())
    }

    /// Claim the next dequeuable item of `queue_key` for `owner`.
    ///
    /// Only items whose job type is in `job_types` are considered. Returns
    /// `None` when the key is empty, nothing may run right now, or other
    /// writers kept changing the queue.
    pub async fn try_dequeue_next(
        &self,
        queue_key: &str,
        owner: &ProcessId,
        job_types: &[String],
    ) -> Result<Option<SyncQueueItem>, DbError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            // Gate first: any change to the queue after this read moves it.
            let gate_version = self.gate_version(queue_key).await?;
            let items = self.items_for_key(queue_key).await?;
            let Some(candidate) = dequeue_candidates(&items)
                .into_iter()
                .find(|item| job_types.contains(&item.job_type))
            else {
                return Ok(None);
            };

            if self.claim(candidate, gate_version, owner).await? {
                let mut claimed = candidate.clone();
                claimed.dequeued_at = Some(Utc::now());
                claimed.owner = Some(owner.clone());
                claimed.version += 1;
                return Ok(Some(claimed));
            }
            tracing::debug!(
                "Lost dequeue race for item {} on {}",
                candidate.item_id,
                queue_key
            );
        }
        Ok(None)
    }

    async fn gate_version(&self, queue_key: &str) -> Result<Option<u64>, DbError> {
        let mut response = self
            .db
            .query("SELECT version FROM type::thing('sync_queue', $key)")
            .bind(("key", queue_key.to_string()))
            .await?;
        let rows: Vec<GateRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(|row| row.version))
    }

    /// Mark `item` dequeued if its queue is still as it was at `gate_version`.
    async fn claim(
        &self,
        item: &SyncQueueItem,
        gate_version: Option<u64>,
        owner: &ProcessId,
    ) -> Result<bool, DbError> {
        let Some(gate_version) = gate_version else {
            return Ok(false);
        };

        cas_applied(
            self.db
                .query(
                    r#"
                    BEGIN TRANSACTION;
                    LET $opened = (
                        UPDATE type::thing('sync_queue', $key)
                        SET version += 1, updated_at = $now_ms
                        WHERE version = $gate_version
                        RETURN version
                    );
                    UPDATE type::thing('sync_queue_item', $item_id)
                        SET dequeued_at = $now_ms, owner = $owner, version += 1
                        WHERE dequeued_at = NONE AND array::len($opened) > 0
                        RETURN version;
                    COMMIT TRANSACTION;
                    "#,
                )
                .bind(("key", item.queue_key.clone()))
                .bind(("gate_version", gate_version))
                .bind(("item_id", item.item_id.to_string()))
                .bind(("now_ms", now_ms()))
                .bind(("owner", owner.as_str().to_string())),
        )
        .await
    }

    /// Dequeued items, optionally only those of one owner or only exclusive ones.
    pub async fn active_items(
        &self,
        owner: Option<&ProcessId>,
        exclusive_only: bool,
    ) -> Result<Vec<SyncQueueItem>, DbError> {
        let mut conditions = vec!["dequeued_at != NONE"];
        if owner.is_some() {
            conditions.push("owner = $owner");
        }
        if exclusive_only {
            conditions.push("exclusive = true");
        }

        let query = format!(
            "SELECT * OMIT id FROM sync_queue_item WHERE {} ORDER BY item_id ASC",
            conditions.join(" AND ")
        );
        let mut request = self.db.query(query);
        if let Some(owner) = owner {
            request = request.bind(("owner", owner.as_str().to_string()));
        }

        let mut response = request.await?;
        let items: Vec<SyncQueueItem> = response.take(0)?;
        Ok(items)
    }

    /// Items still waiting after being enqueued before `older_than`.
    ///
    /// Diagnostic only: reporting an item does not unblock it.
    pub async fn blocked_items(
        &self,
        older_than: DateTime<Utc>,
        exclusive_only: bool,
    ) -> Result<Vec<SyncQueueItem>, DbError> {
        let query = if exclusive_only {
            "SELECT * OMIT id FROM sync_queue_item WHERE dequeued_at = NONE AND enqueued_at < $cutoff AND exclusive = true ORDER BY item_id ASC"
        } else {
            "SELECT * OMIT id FROM sync_queue_item WHERE dequeued_at = NONE AND enqueued_at < $cutoff ORDER BY item_id ASC"
        };

        let mut response = self
            .db
            .query(query)
            .bind(("cutoff", older_than.timestamp_millis()))
            .await?;
        let items: Vec<SyncQueueItem> = response.take(0)?;
        Ok(items)
    }

    /// Remove the items of a finished job, unblocking the rest of its queue.
    pub async fn remove_for_job(&self, job_id: JobId) -> Result<(), DbError> {
        self.db
            .query("DELETE sync_queue_item WHERE job_id = $job_id RETURN NONE")
            .bind(("job_id", job_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Put the items of a recovered job back to waiting at their original
    /// queue position.
    pub async fn release_job(&self, job_id: JobId) -> Result<(), DbError> {
        self.db
            .query(
                r#"
                UPDATE sync_queue_item
                SET dequeued_at = NONE, owner = NONE, version += 1
                WHERE job_id = $job_id
                RETURN NONE
                "#,
            )
            .bind(("job_id", job_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Drop gate rows of queues that are empty and untouched since `cutoff`.
    pub async fn prune_gates(&self, cutoff: DateTime<Utc>) -> Result<(), DbError> {
        self.db
            .query(
                r#"
                DELETE sync_queue
                WHERE updated_at < $cutoff
                    AND queue_key NOTINSIDE (SELECT VALUE queue_key FROM sync_queue_item)
                RETURN NONE
                "#,
            )
            .bind(("cutoff", cutoff.timestamp_millis()))
            .await?
            .check()?;
        Ok(())
    }
}
