use chrono::Utc;

use crate::resources::ResourceUsage;
use crate::types::{Job, JobMetricsSnapshot, JobStatus, JobSummary};

use super::JobOrchestrator;

impl JobOrchestrator {
    /// Snapshot of every tracked job, oldest first.
    pub fn get_job_status(&self) -> Vec<JobSummary> {
        self.store.list().iter().map(Job::summary).collect()
    }

    /// Full record of one job.
    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id)
    }

    /// Current dynamic ceiling.
    pub fn current_ceiling(&self) -> usize {
        self.lock_admission().ceiling.current()
    }

    /// Jobs counted against the ceiling right now.
    pub fn active_jobs(&self) -> usize {
        self.lock_admission().active
    }

    /// Most recent resource sample.
    pub fn latest_usage(&self) -> Option<ResourceUsage> {
        *self
            .latest_usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Aggregate counts for operators.
    pub fn metrics(&self) -> JobMetricsSnapshot {
        let now = Utc::now();
        let jobs = self.store.list();

        let mut pending = 0usize;
        let mut running = 0usize;
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut cancelled = 0usize;
        let mut longest_running = None::<u64>;

        for job in &jobs {
            match job.status {
                JobStatus::Pending => pending += 1,
                JobStatus::Running => {
                    running += 1;
                    if let Some(started) = job.start_time {
                        let age = u64::try_from((now - started).num_seconds()).unwrap_or(0);
                        longest_running = Some(longest_running.map_or(age, |v| v.max(age)));
                    }
                }
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Cancelled => cancelled += 1,
            }
        }

        let (concurrency_ceiling, active_jobs) = {
            let admission = self.lock_admission();
            (admission.ceiling.current(), admission.active)
        };

        JobMetricsSnapshot {
            total_jobs: jobs.len(),
            pending,
            running,
            completed,
            failed,
            cancelled,
            concurrency_ceiling,
            active_jobs,
            longest_running_age_secs: longest_running,
        }
    }
}
