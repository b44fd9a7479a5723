//! Housekeeper actor: liveness, recovery and retention.
//!
//! Every sweep, in order:
//!
//! 1. Refreshes this process's heartbeat
//! 2. Returns jobs of dead processes to their queue, or fails them once they
//!    ran out of recovery attempts
//! 3. Times out expired joins
//! 4. Queues wakeups for completed joins of local parents (the cross-process
//!    wakeup path)
//! 5. Reports sync queue items waiting past the blocked threshold
//! 6. Purges terminal jobs past retention, and the bookkeeping of queues
//!    that stayed empty as long

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use job_core::{JobEvent, JobResult, JobStatus};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::messages::{DispatchError, HousekeeperMessage, SweepReport};
use crate::services::Services;

pub struct HousekeeperState {
    services: Arc<Services>,
    /// Set during a periodic sweep so slow sweeps do not queue up ticks.
    sweeping: Arc<AtomicBool>,
}

pub struct Housekeeper;

impl Actor for Housekeeper {
    type Msg = HousekeeperMessage;
    type State = HousekeeperState;
    type Arguments = Arc<Services>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        services: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting housekeeper for {}", services.process_id);

        let sweeping = Arc::new(AtomicBool::new(false));

        // Start periodic tick
        let myself_clone = myself.clone();
        let ticker_sweeping = sweeping.clone();
        let period = services.config.housekeeper_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if ticker_sweeping.swap(true, Ordering::AcqRel) {
                    continue;
                }
                if myself_clone.send_message(HousekeeperMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(HousekeeperState { services, sweeping })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            HousekeeperMessage::Tick => {
                match sweep(&state.services).await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::debug!("Housekeeping sweep: {:?}", report);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Housekeeping sweep failed: {}", e),
                }
                state.sweeping.store(false, Ordering::Release);
            }

            HousekeeperMessage::Sweep { reply } => {
                let result = sweep(&state.services).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
        }

        Ok(())
    }
}

/// Run one housekeeping pass for the process owning `services`.
pub(crate) async fn sweep(services: &Services) -> Result<SweepReport, DispatchError> {
    let mut report = SweepReport::default();
    let config = &services.config;

    services.processes.heartbeat(&services.process_id).await?;

    recover_orphans(services, &mut report).await?;

    let now = Utc::now();
    report.expired_joins = services.coordinator.expire_due(now).await?;

    let mut parents = HashSet::new();
    for join in services
        .joins
        .ready_for_process(&services.process_id, now)
        .await?
    {
        if parents.insert(join.parent_job_id) && services.inbox.push(join.parent_job_id) {
            report.wakeups_queued += 1;
        }
    }

    let blocked_cutoff = before(now, config.blocked_item_threshold);
    let blocked = services.queues.blocked_items(blocked_cutoff, false).await?;
    for item in &blocked {
        tracing::warn!(
            "Job {} has waited on {} since {}",
            item.job_id,
            item.queue_key,
            item.enqueued_at
        );
    }
    report.blocked_items = blocked.len();

    let retention_cutoff = before(now, config.job_retention);
    report.expunged = services.jobs.expunge(retention_cutoff).await?;
    if report.expunged > 0 {
        tracing::info!("Expunged {} job(s) finished before {}", report.expunged, retention_cutoff);
        services.publish_event(&JobEvent::JobsExpunged {
            count: report.expunged,
            cutoff: retention_cutoff,
            timestamp: Utc::now(),
        });
    }
    services.queues.prune_gates(retention_cutoff).await?;

    Ok(report)
}

/// Requeue or abandon in-progress jobs whose owner stopped heartbeating.
async fn recover_orphans(services: &Services, report: &mut SweepReport) -> Result<(), DispatchError> {
    let cutoff = before(Utc::now(), services.config.process_timeout);
    let live: HashSet<_> = services
        .processes
        .live_processes(cutoff)
        .await?
        .into_iter()
        .collect();

    for job in services.jobs.in_progress().await? {
        let orphaned = match &job.owner {
            Some(owner) => !live.contains(owner),
            None => true,
        };
        if !orphaned {
            continue;
        }

        if job.recovery_attempts >= services.config.max_recovery_attempts {
            tracing::warn!(
                "Abandoning job {} after {} recoveries",
                job.job_id,
                job.recovery_attempts
            );
            let result = JobResult::new(format!(
                "Abandoned after {} recovery attempts",
                job.recovery_attempts
            ));
            if services.finish(&job, JobStatus::Failed, result).await? {
                report.abandoned += 1;
            }
            continue;
        }

        if !services.jobs.requeue_orphan(&job).await? {
            // Another housekeeper or the owner itself got there first.
            continue;
        }
        services.queues.release_job(job.job_id).await?;
        services.coordinator.disjoin_all(job.job_id).await?;
        report.requeued += 1;

        tracing::info!(
            "Requeued job {} of dead process {:?}",
            job.job_id,
            job.owner
        );
        services.publish_event(&JobEvent::JobRequeued {
            job_id: job.job_id,
            previous_owner: job.owner.clone(),
            attempt: job.recovery_attempts + 1,
            timestamp: Utc::now(),
        });
    }

    Ok(())
}

/// `now` moved back by `duration`, saturating at the earliest representable time.
fn before(now: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(duration)
        .ok()
        .and_then(|duration| now.checked_sub_signed(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoffs_saturate() {
        let now = Utc::now();
        assert_eq!(
            before(now, std::time::Duration::from_secs(60)),
            now - ChronoDuration::seconds(60)
        );
        assert_eq!(
            before(now, std::time::Duration::MAX),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
