//! Built-in job types of the management server.
//!
//! - `host.ping` answers with its payload
//! - `disk.copy` copies one disk, checkpointing as it goes
//! - `vm.snapshot` fans out one `disk.copy` per disk and completes once every
//!   copy reported back through `snapshot.collect`

use std::time::Duration;

use actors::{
    HandlerOutcome, JobContext, JobHandlerRegistry, JobRequest, Wakeup, WakeupRegistry,
    job_handler, wakeup_handler,
};
use job_core::{JobResult, JoinStatus, ResourceRef};
use serde_json::json;

pub fn registries() -> (JobHandlerRegistry, WakeupRegistry) {
    let mut handlers = JobHandlerRegistry::new();
    handlers.register(job_handler!("host.ping", |ctx| Ok(HandlerOutcome::Complete(
        JobResult::with_output("pong", ctx.payload().clone())
    ))));
    handlers.register(job_handler!("disk.copy", |ctx| copy_disk(ctx).await));
    handlers.register(job_handler!("vm.snapshot", |ctx| snapshot(ctx).await));

    let mut wakeups = WakeupRegistry::new();
    wakeups.register(wakeup_handler!("snapshot.collect", |ctx, wakeup| {
        collect(ctx, wakeup).await
    }));

    (handlers, wakeups)
}

async fn copy_disk(ctx: JobContext) -> Result<HandlerOutcome, String> {
    let disk = ctx.payload()["disk"].as_str().unwrap_or_default().to_string();
    if disk.is_empty() {
        return Ok(HandlerOutcome::Fail("no disk given".into()));
    }

    for step in ["copying", "verifying"] {
        if ctx.cancel_requested().await.map_err(|e| e.to_string())? {
            return Ok(HandlerOutcome::Fail(format!("copy of {disk} cancelled")));
        }
        ctx.update_step(step).await.map_err(|e| e.to_string())?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(HandlerOutcome::Complete(JobResult::new(format!("{disk} copied"))))
}

async fn snapshot(ctx: JobContext) -> Result<HandlerOutcome, String> {
    let vm = ctx.job().resource.clone();
    let disks: Vec<String> = ctx.payload()["disks"]
        .as_array()
        .map(|disks| {
            disks
                .iter()
                .filter_map(|disk| disk.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if disks.is_empty() {
        return Ok(HandlerOutcome::Complete(JobResult::new("nothing to snapshot")));
    }

    let target = vm.as_ref().map(|vm| vm.to_string()).unwrap_or_default();
    for disk in disks {
        // Disks are independent of each other; the VM itself is held by
        // this job.
        let request = JobRequest::new("disk.copy", json!({ "disk": disk }))
            .on_resource(ResourceRef::new("disk", disk.clone()));
        let child = ctx.submit(request).await.map_err(|e| e.to_string())?;
        ctx.join(child, "snapshot.collect", &target)
            .await
            .map_err(|e| e.to_string())?;
    }

    Ok(HandlerOutcome::Suspend)
}

async fn collect(ctx: JobContext, wakeup: Wakeup) -> Result<HandlerOutcome, String> {
    match wakeup.status() {
        JoinStatus::Succeeded => {}
        JoinStatus::Failed => {
            return Ok(HandlerOutcome::Fail(format!(
                "disk copy {} failed on {}",
                wakeup.child_job_id(),
                wakeup.target()
            )));
        }
        JoinStatus::TimedOut => {
            return Ok(HandlerOutcome::Fail(format!(
                "disk copy {} did not finish in time",
                wakeup.child_job_id()
            )));
        }
    }

    let remaining = ctx.pending_joins().await.map_err(|e| e.to_string())?;
    if remaining.is_empty() {
        Ok(HandlerOutcome::Complete(JobResult::new(format!(
            "snapshot of {} complete",
            wakeup.target()
        ))))
    } else {
        tracing::debug!("{} disk copies outstanding for {}", remaining.len(), wakeup.target());
        Ok(HandlerOutcome::Suspend)
    }
}
