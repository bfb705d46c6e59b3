use std::sync::Arc;
use std::time::Duration;

use todo_events::{RuntimeEvent, sources, topics};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::resources::ResourceUsage;
use crate::spawner::{ProcessExit, ProcessHandle};
use crate::types::{JobProgress, JobStatus};

use super::{CANCELLED_ERROR, JobOrchestrator};

/// How long a supervisor waits for buffered output after the process exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const PROGRESS_PREFIX: &str = "@progress ";
const RESULT_PREFIX: &str = "@result ";

/// One line of job output, classified.
#[derive(Debug, PartialEq)]
enum OutputLine {
    Progress(JobProgress),
    Result(serde_json::Value),
    Log(String),
}

fn classify_output(line: String) -> OutputLine {
    if let Some(body) = line.strip_prefix(PROGRESS_PREFIX)
        && let Ok(progress) = serde_json::from_str::<JobProgress>(body)
    {
        return OutputLine::Progress(progress);
    }
    if let Some(body) = line.strip_prefix(RESULT_PREFIX)
        && let Ok(value) = serde_json::from_str(body)
    {
        return OutputLine::Result(value);
    }
    OutputLine::Log(line)
}

impl JobOrchestrator {
    pub(super) fn spawn_supervisor(
        self: &Arc<Self>,
        job_id: String,
        command: String,
        mut handle: Box<dyn ProcessHandle>,
        output: Option<mpsc::Receiver<String>>,
        token: CancellationToken,
    ) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let reader = output.map(|rx| {
                let orchestrator = Arc::clone(&orchestrator);
                let job_id = job_id.clone();
                tokio::spawn(async move { orchestrator.drain_output(&job_id, rx).await })
            });

            // Cancelled before the supervisor got going.
            if orchestrator
                .store
                .get(&job_id)
                .is_some_and(|job| job.status.is_terminal())
            {
                token.cancel();
            }

            let (exit, cancelled) = tokio::select! {
                () = token.cancelled() => {
                    handle.kill().await;
                    (handle.wait().await, true)
                }
                exit = handle.wait() => (exit, false),
            };

            if let Some(reader) = reader
                && tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err()
            {
                tracing::debug!(job_id = %job_id, "job output still open after exit");
            }

            orchestrator.complete_job(&job_id, &exit, cancelled);
            drop(handle);
            orchestrator.lock_supervisors().remove(&job_id);
            orchestrator.release(&command);
        });
    }

    async fn drain_output(&self, job_id: &str, mut rx: mpsc::Receiver<String>) {
        while let Some(line) = rx.recv().await {
            match classify_output(line) {
                OutputLine::Progress(progress) => {
                    if self.store.update_progress(job_id, progress) {
                        self.publish_job_event(topics::JOB_PROGRESS, job_id);
                    }
                }
                OutputLine::Result(value) => {
                    self.store.set_result(job_id, value);
                }
                OutputLine::Log(line) => {
                    self.store.append_log(job_id, &line);
                }
            }
        }
    }

    fn complete_job(&self, job_id: &str, exit: &ProcessExit, cancelled: bool) {
        let (status, error, topic) = if cancelled {
            (
                JobStatus::Cancelled,
                Some(CANCELLED_ERROR.to_string()),
                topics::JOB_CANCELLED,
            )
        } else if exit.success() {
            (JobStatus::Completed, None, topics::JOB_COMPLETED)
        } else {
            (JobStatus::Failed, Some(exit.describe()), topics::JOB_FAILED)
        };

        if !self.store.finish(job_id, status, error, exit.code) {
            tracing::debug!(job_id, %status, "job already terminal at process exit");
            return;
        }
        match status {
            JobStatus::Failed => {
                let detail = exit.describe();
                self.store.append_log(job_id, &detail);
                tracing::warn!(job_id, exit_code = ?exit.code, %detail, "job failed");
            }
            JobStatus::Cancelled => {
                self.store.append_log(job_id, "job cancelled");
                tracing::info!(job_id, "job cancelled");
            }
            _ => tracing::info!(job_id, "job completed"),
        }
        self.publish_job_event(topic, job_id);
    }

    /// Take one resource sample, adjust the ceiling and publish the update.
    /// Returns `None` once the orchestrator is shut down.
    pub fn sample_now(&self) -> Option<ResourceUsage> {
        let total_jobs = self.store.len();
        let mut admission = self.lock_admission();
        if admission.closed {
            return None;
        }

        let mut usage = self
            .sampler
            .sample(admission.active, total_jobs, admission.ceiling.current());
        if let Some((old, new)) = admission
            .ceiling
            .adjust(usage.memory_fraction, usage.cpu_fraction)
        {
            tracing::info!(
                old,
                new,
                memory = usage.memory_fraction,
                cpu = usage.cpu_fraction,
                "concurrency ceiling adjusted"
            );
            self.events.publish(RuntimeEvent::from_payload(
                sources::SAMPLER,
                topics::RESOURCE_CEILING_CHANGED,
                &serde_json::json!({ "old": old, "new": new }),
            ));
        }
        usage.concurrency_ceiling = admission.ceiling.current();
        tracing::trace!(
            memory = usage.memory_fraction,
            cpu = usage.cpu_fraction,
            active = usage.active_jobs,
            "resource sample"
        );

        // Published under the admission lock so shutdown cannot interleave.
        self.events.publish(RuntimeEvent::from_payload(
            sources::SAMPLER,
            topics::RESOURCE_UPDATE,
            &usage,
        ));
        *self
            .latest_usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(usage);
        Some(usage)
    }

    pub(super) fn spawn_sampling_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        let stop = self.stop.clone();
        let period = self.config.sample_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                if orchestrator.sample_now().is_none() {
                    break;
                }
            }
        })
    }

    pub(super) fn spawn_retention_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        let stop = self.stop.clone();
        let period = self.config.sweep_interval();
        let retention = self.config.retention();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.store.cleanup(retention);
            }
        })
    }
}
