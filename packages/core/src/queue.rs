//! Sync queue domain types: per-resource FIFO items and the dequeue policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{JobId, ProcessId, ResourceRef, job::next_ulid};

/// Unique identifier for a sync queue item. Sorts in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncItemId(pub Ulid);

impl SyncItemId {
    pub fn new() -> Self {
        Self(next_ulid())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for SyncItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job waiting in, or being served from, the queue of its resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub item_id: SyncItemId,
    /// [`ResourceRef::queue_key`] of the resource.
    pub queue_key: String,
    pub resource: ResourceRef,
    pub job_id: JobId,
    /// Copied from the job so a process can skip work it has no handler for.
    pub job_type: String,
    pub exclusive: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub dequeued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ProcessId>,
    #[serde(default)]
    pub version: u64,
}

impl SyncQueueItem {
    pub fn new(resource: ResourceRef, job_id: JobId, job_type: impl Into<String>, exclusive: bool) -> Self {
        Self {
            item_id: SyncItemId::new(),
            queue_key: resource.queue_key(),
            resource,
            job_id,
            job_type: job_type.into(),
            exclusive,
            enqueued_at: Utc::now(),
            dequeued_at: None,
            owner: None,
            version: 0,
        }
    }

    /// Dequeued and not yet completed.
    pub fn is_active(&self) -> bool {
        self.dequeued_at.is_some()
    }
}

/// Items of one queue key that may be dequeued right now, oldest first.
///
/// `items` must all share a key and be sorted by enqueue order.
///
/// - Nothing is dequeuable while an exclusive item is active.
/// - An exclusive item is dequeuable only as the head with nothing active.
/// - Non-exclusive items are dequeuable up to the first waiting exclusive
///   item; they never overtake an older exclusive item.
pub fn dequeue_candidates(items: &[SyncQueueItem]) -> Vec<&SyncQueueItem> {
    let any_active = items.iter().any(SyncQueueItem::is_active);
    if items.iter().any(|item| item.is_active() && item.exclusive) {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for item in items.iter().filter(|item| !item.is_active()) {
        if item.exclusive {
            if candidates.is_empty() && !any_active {
                candidates.push(item);
            }
            break;
        }
        candidates.push(item);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(exclusive: bool, active: bool) -> SyncQueueItem {
        let mut item = SyncQueueItem::new(ResourceRef::new("vm", "1"), JobId::new(), "op", exclusive);
        if active {
            item.dequeued_at = Some(Utc::now());
        }
        item
    }

    fn ids(candidates: &[&SyncQueueItem]) -> Vec<SyncItemId> {
        candidates.iter().map(|item| item.item_id).collect()
    }

    #[test]
    fn exclusive_head_waits_for_active_items() {
        let items = vec![item(false, true), item(true, false), item(false, false)];
        assert!(dequeue_candidates(&items).is_empty());

        let items = vec![item(true, false), item(true, false)];
        assert_eq!(ids(&dequeue_candidates(&items)), vec![items[0].item_id]);
    }

    #[test]
    fn active_exclusive_blocks_everything() {
        let items = vec![item(true, true), item(false, false), item(false, false)];
        assert!(dequeue_candidates(&items).is_empty());
    }

    #[test]
    fn shared_items_run_together_but_stop_at_older_exclusive() {
        let items = vec![
            item(false, true),
            item(false, false),
            item(false, false),
            item(true, false),
            item(false, false),
        ];
        assert_eq!(
            ids(&dequeue_candidates(&items)),
            vec![items[1].item_id, items[2].item_id]
        );
    }

    #[test]
    fn empty_queue_has_no_candidates() {
        assert!(dequeue_candidates(&[]).is_empty());
    }
}
