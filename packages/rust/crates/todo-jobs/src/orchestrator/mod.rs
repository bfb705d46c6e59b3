//! Job orchestrator: admission against a dynamic ceiling, one supervisor task
//! per process, resource sampling and retention sweeps.

mod metrics;
mod runtime;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use todo_events::{EventBus, RuntimeEvent, sources, topics};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::error::{JobError, LimitScope, Result};
use crate::resources::{ConcurrencyCeiling, MetricsSource, ResourceSampler, ResourceUsage};
use crate::spawner::ProcessSpawner;
use crate::store::JobStore;
use crate::types::{Job, JobEvent, JobOptions, JobStatus};

/// Error text for jobs stopped by `cancel_job` or `shutdown`.
pub const CANCELLED_ERROR: &str = "cancelled";

#[derive(Debug)]
struct Admission {
    ceiling: ConcurrencyCeiling,
    active: usize,
    per_command: HashMap<String, usize>,
    closed: bool,
}

/// Runs background jobs as supervised processes.
///
/// Construct with [`JobOrchestrator::start`] and pass the returned `Arc` to
/// whatever needs it.
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    store: Arc<JobStore>,
    spawner: Arc<dyn ProcessSpawner>,
    sampler: ResourceSampler,
    events: EventBus,
    admission: Mutex<Admission>,
    supervisors: Mutex<HashMap<String, CancellationToken>>,
    latest_usage: Mutex<Option<ResourceUsage>>,
    stop: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl JobOrchestrator {
    /// Start the orchestrator with its sampling and retention loops.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        store: Arc<JobStore>,
        spawner: Arc<dyn ProcessSpawner>,
        metrics: Arc<dyn MetricsSource>,
        events: EventBus,
    ) -> Arc<Self> {
        let config = config.normalized();
        let ceiling = ConcurrencyCeiling::new(
            config.max_concurrent_jobs,
            config.memory_high_water,
            config.low_water,
        );

        let orchestrator = Arc::new(Self {
            store,
            spawner,
            sampler: ResourceSampler::new(metrics),
            events,
            admission: Mutex::new(Admission {
                ceiling,
                active: 0,
                per_command: HashMap::new(),
                closed: false,
            }),
            supervisors: Mutex::new(HashMap::new()),
            latest_usage: Mutex::new(None),
            stop: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            config,
        });

        let sampling = orchestrator.spawn_sampling_loop();
        let sweeping = orchestrator.spawn_retention_loop();
        orchestrator.lock_background().extend([sampling, sweeping]);

        tracing::info!(
            ceiling = orchestrator.config.max_concurrent_jobs,
            sample_interval_ms = orchestrator.config.sample_interval_ms,
            persistent = orchestrator.store.root().is_some(),
            "job orchestrator started"
        );
        orchestrator
    }

    /// Effective configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Backing job store.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Admit and start a job. Returns its id without waiting for completion.
    ///
    /// # Errors
    ///
    /// - [`JobError::ConcurrencyLimitExceeded`] when the global ceiling or
    ///   the command's own limit is reached; nothing is recorded.
    /// - [`JobError::Spawn`] when the process cannot start; the job is
    ///   recorded as failed.
    /// - [`JobError::ShutDown`] after [`JobOrchestrator::shutdown`], or when
    ///   a concurrent shutdown cancelled the job before its process started.
    pub fn submit(
        self: &Arc<Self>,
        command: &str,
        args: Vec<String>,
        options: JobOptions,
    ) -> Result<String> {
        let job = Job::new(command, args, options);
        let job_id = job.id.clone();
        let process_args = job.process_args();
        self.admit(job)?;

        let mut handle = match self.spawner.spawn(command, &process_args) {
            Ok(handle) => handle,
            Err(error) => {
                let reason = error.to_string();
                tracing::error!(job_id = %job_id, command, %reason, "failed to spawn job process");
                let message = format!("spawn failed: {reason}");
                self.store.append_log(&job_id, &message);
                if self
                    .store
                    .finish(&job_id, JobStatus::Failed, Some(message), None)
                {
                    self.publish_job_event(topics::JOB_FAILED, &job_id);
                }
                self.release(command);
                return Err(JobError::Spawn {
                    command: command.to_string(),
                    reason,
                });
            }
        };

        let output = handle.take_output();
        let token = CancellationToken::new();
        self.lock_supervisors()
            .insert(job_id.clone(), token.clone());
        let started = self.store.mark_running(&job_id, handle.pid());
        if !started || self.lock_admission().closed {
            // Shutdown ran between admission and now; the supervisor kills
            // the process and releases the slot.
            tracing::info!(job_id = %job_id, command, "job stopped by concurrent shutdown");
            token.cancel();
            self.spawn_supervisor(job_id, command.to_string(), handle, output, token);
            return Err(JobError::ShutDown);
        }

        tracing::info!(job_id = %job_id, command, pid = ?handle.pid(), "job started");
        self.publish_job_event(topics::JOB_STARTED, &job_id);
        self.spawn_supervisor(job_id.clone(), command.to_string(), handle, output, token);
        Ok(job_id)
    }

    /// Wait until `job_id` is terminal and return its final record.
    ///
    /// # Errors
    ///
    /// [`JobError::WaitTimeout`] when `timeout` elapses first (the job keeps
    /// running); [`JobError::JobNotFound`] for unknown ids.
    pub async fn wait_for_job(&self, job_id: &str, timeout: Duration) -> Result<Job> {
        let mut status = self
            .store
            .subscribe(job_id)
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;

        let reached = tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
            .await
            .map(|outcome| outcome.is_ok());

        match reached {
            Ok(_) => self
                .store
                .get(job_id)
                .ok_or_else(|| JobError::JobNotFound(job_id.to_string())),
            Err(_) => Err(JobError::WaitTimeout {
                job_id: job_id.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Stop a job. Terminal jobs are left as they are; returns the final
    /// status either way.
    ///
    /// # Errors
    ///
    /// [`JobError::JobNotFound`] for unknown ids.
    pub async fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }

        tracing::info!(job_id, "cancelling job");
        let token = self.lock_supervisors().get(job_id).cloned();
        Ok(self.settle_cancelled(job_id, token).await)
    }

    async fn settle_cancelled(&self, job_id: &str, token: Option<CancellationToken>) -> JobStatus {
        if let Some(token) = token {
            token.cancel();
            match self.wait_for_job(job_id, self.config.cancel_grace()).await {
                Ok(job) => return job.status,
                Err(JobError::WaitTimeout { timeout_ms, .. }) => {
                    tracing::warn!(job_id, timeout_ms, "process ignored kill, marking cancelled");
                }
                Err(error) => {
                    tracing::warn!(job_id, %error, "cancel lost track of job");
                }
            }
        }

        if self.store.finish(
            job_id,
            JobStatus::Cancelled,
            Some(CANCELLED_ERROR.to_string()),
            None,
        ) {
            self.store.append_log(job_id, "job cancelled");
            self.publish_job_event(topics::JOB_CANCELLED, job_id);
        }
        self.store
            .get(job_id)
            .map_or(JobStatus::Cancelled, |job| job.status)
    }

    /// Stop sampling, cancel every live job and drop process bookkeeping.
    /// Idempotent. No resource updates are published once this returns.
    pub async fn shutdown(&self) {
        {
            let mut admission = self.lock_admission();
            if admission.closed {
                return;
            }
            admission.closed = true;
        }

        self.stop.cancel();
        let loops = std::mem::take(&mut *self.lock_background());
        for task in loops {
            task.abort();
            let _ = task.await;
        }

        let live: Vec<(String, Option<CancellationToken>)> = self
            .store
            .list()
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| {
                let token = self.lock_supervisors().get(&job.id).cloned();
                (job.id, token)
            })
            .collect();
        for (_, token) in &live {
            if let Some(token) = token {
                token.cancel();
            }
        }
        let settled = futures::future::join_all(
            live.iter()
                .map(|(job_id, token)| self.settle_cancelled(job_id, token.clone())),
        )
        .await;

        self.lock_supervisors().clear();
        self.events.publish(RuntimeEvent::with_string(
            sources::ORCHESTRATOR,
            topics::SYSTEM_SHUTDOWN,
            "job orchestrator stopped",
        ));
        tracing::info!(cancelled = settled.len(), "job orchestrator shut down");
    }

    /// Reserve a slot for `job` and record it as pending. Both happen under
    /// the admission lock so a shutdown either refuses the job or sees it.
    fn admit(&self, job: Job) -> Result<()> {
        let command = job.command.as_str();
        let mut admission = self.lock_admission();
        if admission.closed {
            return Err(JobError::ShutDown);
        }

        let command_limit = self.config.command_limit(command);
        let ceiling = admission.ceiling.current();
        if admission.active >= ceiling {
            tracing::warn!(command, active = admission.active, ceiling, "global job ceiling reached");
            return Err(JobError::ConcurrencyLimitExceeded {
                command: command.to_string(),
                limit: ceiling,
                active: admission.active,
                scope: LimitScope::Global,
                command_limit,
            });
        }

        let running = admission.per_command.get(command).copied().unwrap_or(0);
        if let Some(limit) = command_limit
            && running >= limit
        {
            tracing::warn!(command, running, limit, "command concurrency limit reached");
            return Err(JobError::ConcurrencyLimitExceeded {
                command: command.to_string(),
                limit,
                active: running,
                scope: LimitScope::Command,
                command_limit,
            });
        }

        admission.active += 1;
        *admission.per_command.entry(command.to_string()).or_default() += 1;
        self.store.insert(job);
        Ok(())
    }

    fn release(&self, command: &str) {
        let mut admission = self.lock_admission();
        admission.active = admission.active.saturating_sub(1);
        if let Some(count) = admission.per_command.get_mut(command) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                admission.per_command.remove(command);
            }
        }
    }

    fn publish_job_event(&self, topic: &str, job_id: &str) {
        if let Some(job) = self.store.get(job_id) {
            self.events.publish(RuntimeEvent::from_payload(
                sources::SUPERVISOR,
                topic,
                &JobEvent::from(&job),
            ));
        }
    }

    fn lock_admission(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_supervisors(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_background(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .field("admission", &*self.lock_admission())
            .finish_non_exhaustive()
    }
}
