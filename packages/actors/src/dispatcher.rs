//! Dispatcher actor: owns the worker pool and the housekeeper of one process.

use std::sync::Arc;
use std::time::Duration;

use db::Database;
use db::repositories::{JobRepository, JoinRepository, SyncQueueRepository, WorkSubmission};
use job_core::{FrameworkConfig, JobId, JobStatusReport, ProcessId, subjects};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::bus::{MessageBus, Subscriber};
use crate::context::JobRequest;
use crate::handler::{JobHandlerRegistry, WakeupRegistry};
use crate::housekeeper::Housekeeper;
use crate::messages::{
    DispatchError, DispatcherMessage, HousekeeperMessage, SweepReport, WorkerMessage,
};
use crate::services::Services;
use crate::worker_actor::{WorkerActor, WorkerArgs};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on one bus wait in [`DispatcherHandle::wait_for`], so
/// completions recorded by other processes are noticed too.
const WAIT_SLICE: Duration = Duration::from_millis(200);

/// State for the dispatcher actor.
pub struct DispatcherState {
    services: Arc<Services>,
    workers: Vec<(ActorRef<WorkerMessage>, JoinHandle<()>)>,
    housekeeper: Option<(ActorRef<HousekeeperMessage>, JoinHandle<()>)>,
    /// Completion listener registered on the bus.
    completions: Arc<dyn Subscriber>,
}

/// Dispatcher actor that spawns and supervises workers and the housekeeper.
pub struct Dispatcher;

impl Actor for Dispatcher {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = Arc<Services>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        services: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let process_id = services.process_id.clone();
        tracing::info!(
            "Starting dispatcher {} with {} worker(s) for {:?}",
            process_id,
            services.config.worker_pool_size,
            services.job_types
        );

        services
            .processes
            .register(&process_id)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to register process: {}", e)))?;

        let mut workers = Vec::with_capacity(services.config.worker_pool_size);
        for n in 0..services.config.worker_pool_size {
            let worker_id = format!("worker-{}-{}", n + 1, process_id);
            let args = WorkerArgs {
                worker_id: worker_id.clone(),
                services: services.clone(),
            };
            let worker = Actor::spawn_linked(Some(worker_id), WorkerActor, args, myself.get_cell())
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;
            workers.push(worker);
        }

        let housekeeper = Actor::spawn_linked(
            Some(format!("housekeeper-{}", process_id)),
            Housekeeper,
            services.clone(),
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn housekeeper: {}", e)))?;

        // Local wakeup path: every completion published in this process is
        // turned into a ChildCompleted message.
        let dispatcher = myself.clone();
        let completions: Arc<dyn Subscriber> =
            Arc::new(move |_sender: &str, subject: &str, _payload: &Value| {
                let token = subject.rsplit('.').next().unwrap_or_default();
                let child_job_id = JobId::parse(token)
                    .map_err(|e| format!("Bad job id in subject {}: {}", subject, e))?;
                dispatcher
                    .send_message(DispatcherMessage::ChildCompleted { child_job_id })
                    .map_err(|e| format!("Dispatcher unavailable: {}", e))
            });
        services
            .bus
            .subscribe(subjects::JOB_COMPLETED_ALL, completions.clone())
            .map_err(|e| ActorProcessingErr::from(format!("Failed to subscribe: {}", e)))?;

        Ok(DispatcherState {
            services,
            workers,
            housekeeper: Some(housekeeper),
            completions,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let services = &state.services;
        services
            .bus
            .unsubscribe(subjects::JOB_COMPLETED_ALL, &state.completions);

        for (worker, _) in &state.workers {
            worker.stop(None);
        }
        for (worker, handle) in state.workers.drain(..) {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!(
                    "Worker {} did not stop in time",
                    worker.get_name().unwrap_or_default()
                );
            }
        }
        if let Some((housekeeper, handle)) = state.housekeeper.take() {
            housekeeper.stop(None);
            let _ = tokio::time::timeout(STOP_TIMEOUT, handle).await;
        }

        tracing::info!("Dispatcher {} stopped", services.process_id);
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Submit { request, reply } => {
                let result = state.services.submit(request).await;
                if result.is_ok() {
                    wake_workers(state);
                }
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }

            DispatcherMessage::SubmitWork { request, reply } => {
                let result = state.services.submit_work(request).await;
                if matches!(result, Ok(ref submission) if !submission.attached) {
                    wake_workers(state);
                }
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }

            DispatcherMessage::GetStatus { job_id, reply } => {
                let result = state.services.jobs.status(job_id).await;
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }

            DispatcherMessage::ChildCompleted { child_job_id } => {
                let parents = state
                    .services
                    .coordinator
                    .find_ready_to_wake(child_job_id, Some(&state.services.process_id))
                    .await;
                match parents {
                    Ok(parents) if !parents.is_empty() => {
                        for parent in parents {
                            tracing::debug!("Job {} completed, waking job {}", child_job_id, parent);
                            state.services.inbox.push(parent);
                        }
                        wake_workers(state);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // The housekeeper picks these up on its next sweep.
                        tracing::warn!("Failed to find parents of job {}: {}", child_job_id, e);
                    }
                }
            }

            DispatcherMessage::Sweep { reply } => {
                let Some((housekeeper, _)) = &state.housekeeper else {
                    let _ = reply.send(Err("Housekeeper is not running".into()));
                    return Ok(());
                };
                let result = ractor::rpc::call(
                    housekeeper,
                    |reply| HousekeeperMessage::Sweep { reply },
                    Some(RPC_TIMEOUT),
                )
                .await;
                let outcome = match result {
                    Ok(CallResult::Success(report)) => report,
                    Ok(CallResult::Timeout) => Err("Sweep timed out".into()),
                    Ok(CallResult::SenderError) => Err("Housekeeper dropped the sweep".into()),
                    Err(e) => Err(format!("Housekeeper unavailable: {}", e)),
                };
                let _ = reply.send(outcome);
            }

            DispatcherMessage::WakeWorkers => wake_workers(state),
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!(
                    "Child actor {} terminated: {:?}",
                    cell.get_name().unwrap_or_default(),
                    reason
                );
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                tracing::error!(
                    "Child actor {} failed: {}",
                    cell.get_name().unwrap_or_default(),
                    err
                );
            }
            _ => {}
        }
        Ok(())
    }
}

fn wake_workers(state: &DispatcherState) {
    for (worker, _) in &state.workers {
        let _ = worker.send_message(WorkerMessage::Poll);
    }
}

/// Start the dispatcher of process `process_id` on a shared store.
pub async fn start_dispatcher(
    db: Database,
    config: FrameworkConfig,
    handlers: JobHandlerRegistry,
    wakeups: WakeupRegistry,
    process_id: ProcessId,
) -> Result<DispatcherHandle, DispatchError> {
    let services = Arc::new(Services::new(
        db,
        process_id.clone(),
        config,
        Arc::new(handlers),
        Arc::new(wakeups),
    ));

    let (actor, join) = Actor::spawn(
        Some(format!("dispatcher-{}", process_id)),
        Dispatcher,
        services.clone(),
    )
    .await
    .map_err(|e| DispatchError::Actor(format!("Failed to spawn dispatcher: {}", e)))?;

    Ok(DispatcherHandle {
        actor,
        join,
        services,
    })
}

/// Client handle to a running dispatcher.
pub struct DispatcherHandle {
    actor: ActorRef<DispatcherMessage>,
    join: JoinHandle<()>,
    services: Arc<Services>,
}

impl DispatcherHandle {
    pub fn process_id(&self) -> &ProcessId {
        &self.services.process_id
    }

    /// This process's message bus.
    pub fn bus(&self) -> Arc<MessageBus> {
        self.services.bus.clone()
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.services.jobs
    }

    pub fn joins(&self) -> &JoinRepository {
        &self.services.joins
    }

    pub fn queues(&self) -> &SyncQueueRepository {
        &self.services.queues
    }

    pub fn actor(&self) -> &ActorRef<DispatcherMessage> {
        &self.actor
    }

    /// Record and enqueue a job.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, DispatchError> {
        let job = self
            .call(|reply| DispatcherMessage::Submit { request, reply })
            .await?;
        Ok(job.job_id)
    }

    /// Submit resumable work, attaching to unfinished work on the same target.
    pub async fn submit_work(&self, request: JobRequest) -> Result<WorkSubmission, DispatchError> {
        self.call(|reply| DispatcherMessage::SubmitWork { request, reply })
            .await
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatusReport, DispatchError> {
        self.call(|reply| DispatcherMessage::GetStatus { job_id, reply })
            .await
    }

    /// Wait until `job_id` reaches a terminal status.
    pub async fn wait_for(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<JobStatusReport, DispatchError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let completion = [subjects::job_completed(job_id)];

        loop {
            let report = self.services.jobs.status(job_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(DispatchError::Timeout);
            }
            self.services
                .bus
                .await_any(&completion, remaining.min(WAIT_SLICE))
                .await;
        }
    }

    /// Run a housekeeping sweep now.
    pub async fn sweep(&self) -> Result<SweepReport, DispatchError> {
        self.call(|reply| DispatcherMessage::Sweep { reply }).await
    }

    /// Stop the workers and the housekeeper and mark the process stopped.
    pub async fn shutdown(self) -> Result<(), DispatchError> {
        self.actor.stop(None);
        self.join
            .await
            .map_err(|e| DispatchError::Actor(format!("Dispatcher task failed: {}", e)))?;
        self.services
            .processes
            .mark_stopped(&self.services.process_id)
            .await?;
        tracing::info!("Process {} shut down", self.services.process_id);
        Ok(())
    }

    async fn call<T, F>(&self, build: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<Result<T, String>>) -> DispatcherMessage,
    {
        match ractor::rpc::call(&self.actor, build, Some(RPC_TIMEOUT)).await {
            Ok(CallResult::Success(result)) => result.map_err(DispatchError::Actor),
            Ok(CallResult::Timeout) => Err(DispatchError::Timeout),
            Ok(CallResult::SenderError) => {
                Err(DispatchError::Actor("Dispatcher dropped the request".into()))
            }
            Err(e) => Err(DispatchError::Actor(format!("Dispatcher unavailable: {}", e))),
        }
    }
}
