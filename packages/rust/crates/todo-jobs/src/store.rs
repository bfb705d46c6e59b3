//! Job records: single writer, snapshot readers, optional on-disk mirror.
//!
//! With a root directory every record lives at `<root>/jobs/<id>.json` and its
//! log at `<root>/logs/<id>.log`. Disk writes happen under the table's write
//! lock, so the file always matches the last in-memory transition. Write
//! failures are logged and never fail the transition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{JobError, Result};
use crate::persistence::{append_line, read_lines, remove_if_exists, write_json_atomic};
use crate::types::{Job, JobProgress, JobStatus};

/// Error recorded on jobs that were still live when the store was reopened.
pub const RESTART_ERROR: &str = "orchestrator restarted";

struct StoredJob {
    job: Job,
    status_tx: watch::Sender<JobStatus>,
}

impl StoredJob {
    fn new(job: Job) -> Self {
        let (status_tx, _) = watch::channel(job.status);
        Self { job, status_tx }
    }
}

/// In-memory job table with optional persistence.
pub struct JobStore {
    root: Option<PathBuf>,
    jobs: RwLock<HashMap<String, StoredJob>>,
}

impl JobStore {
    /// Store without persistence.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a store under `root` and reload existing records.
    ///
    /// Jobs that were pending or running when the previous process died are
    /// marked failed with [`RESTART_ERROR`]. Unreadable records are skipped.
    ///
    /// # Errors
    ///
    /// [`JobError::Persistence`] when the directories cannot be created or
    /// listed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let jobs_dir = root.join("jobs");
        std::fs::create_dir_all(&jobs_dir).map_err(|error| {
            JobError::Persistence(format!("cannot create {}: {error}", jobs_dir.display()))
        })?;
        std::fs::create_dir_all(root.join("logs")).map_err(|error| {
            JobError::Persistence(format!("cannot create logs under {}: {error}", root.display()))
        })?;

        let entries = std::fs::read_dir(&jobs_dir).map_err(|error| {
            JobError::Persistence(format!("cannot list {}: {error}", jobs_dir.display()))
        })?;

        let store = Self {
            root: Some(root),
            jobs: RwLock::new(HashMap::new()),
        };
        let mut recovered = 0usize;
        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(mut job) = store.load_record(&path) else {
                continue;
            };
            if !job.status.is_terminal() {
                let now = Utc::now();
                job.status = JobStatus::Failed;
                job.error = Some(RESTART_ERROR.to_string());
                job.pid = None;
                job.end_time = Some(job.start_time.map_or(now, |start| start.max(now)));
                job.log_lines.push(RESTART_ERROR.to_string());
                store.persist(&job);
                store.persist_log(&job.id, RESTART_ERROR);
                recovered += 1;
            }
            loaded += 1;
            store.write_guard().insert(job.id.clone(), StoredJob::new(job));
        }

        tracing::info!(loaded, recovered, "job store opened");
        Ok(store)
    }

    fn load_record(&self, path: &Path) -> Option<Job> {
        let parsed = std::fs::read_to_string(path)
            .map_err(|error| error.to_string())
            .and_then(|text| serde_json::from_str::<Job>(&text).map_err(|error| error.to_string()));
        match parsed {
            Ok(mut job) => {
                if let Some(log_path) = self.log_path(&job.id) {
                    match read_lines(&log_path) {
                        Ok(lines) => job.log_lines = lines,
                        Err(error) => {
                            tracing::warn!(job_id = %job.id, error = %format!("{error:#}"), "job log unreadable");
                        }
                    }
                }
                Some(job)
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "skipping unreadable job record");
                None
            }
        }
    }

    /// Persistence root, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn record_path(&self, job_id: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join("jobs").join(format!("{job_id}.json")))
    }

    fn log_path(&self, job_id: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join("logs").join(format!("{job_id}.log")))
    }

    fn persist(&self, job: &Job) {
        if let Some(path) = self.record_path(&job.id)
            && let Err(error) = write_json_atomic(&path, job)
        {
            tracing::warn!(job_id = %job.id, error = %format!("{error:#}"), "failed to persist job");
        }
    }

    fn persist_log(&self, job_id: &str, line: &str) {
        if let Some(path) = self.log_path(job_id)
            && let Err(error) = append_line(&path, line)
        {
            tracing::warn!(job_id, error = %format!("{error:#}"), "failed to append job log");
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, StoredJob>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new job.
    pub fn insert(&self, job: Job) {
        let mut jobs = self.write_guard();
        self.persist(&job);
        for line in &job.log_lines {
            self.persist_log(&job.id, line);
        }
        jobs.insert(job.id.clone(), StoredJob::new(job));
    }

    /// Snapshot of one job.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.read_guard().get(job_id).map(|stored| stored.job.clone())
    }

    /// Snapshot of every job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read_guard()
            .values()
            .map(|stored| stored.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Number of tracked jobs.
    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    /// `true` when no jobs are tracked.
    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    /// Status watch for `job_id`; resolves to terminal exactly once.
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<JobStatus>> {
        self.read_guard()
            .get(job_id)
            .map(|stored| stored.status_tx.subscribe())
    }

    /// `pending -> running`. Returns `false` for unknown or non-pending jobs.
    pub fn mark_running(&self, job_id: &str, pid: Option<u32>) -> bool {
        let mut jobs = self.write_guard();
        let Some(stored) = jobs.get_mut(job_id) else {
            return false;
        };
        if stored.job.status != JobStatus::Pending {
            return false;
        }
        stored.job.status = JobStatus::Running;
        stored.job.pid = pid;
        stored.job.start_time = Some(Utc::now());
        stored.status_tx.send_replace(JobStatus::Running);
        self.persist(&stored.job);
        true
    }

    /// Move a live job to a terminal state. Happens at most once per job;
    /// later calls return `false` and change nothing.
    pub fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
        exit_code: Option<i32>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        let mut jobs = self.write_guard();
        let Some(stored) = jobs.get_mut(job_id) else {
            return false;
        };
        if stored.job.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        stored.job.status = status;
        stored.job.end_time = Some(stored.job.start_time.map_or(now, |start| start.max(now)));
        stored.job.error = error;
        stored.job.exit_code = exit_code;
        stored.job.pid = None;
        if status != JobStatus::Completed {
            stored.job.result = None;
        }
        stored.status_tx.send_replace(status);
        self.persist(&stored.job);
        true
    }

    /// Record the payload a running job reported. Ignored once terminal.
    pub fn set_result(&self, job_id: &str, result: Value) -> bool {
        let mut jobs = self.write_guard();
        match jobs.get_mut(job_id) {
            Some(stored) if !stored.job.status.is_terminal() => {
                stored.job.result = Some(result);
                self.persist(&stored.job);
                true
            }
            _ => false,
        }
    }

    /// Append a line to the job log.
    pub fn append_log(&self, job_id: &str, line: &str) -> bool {
        let mut jobs = self.write_guard();
        let Some(stored) = jobs.get_mut(job_id) else {
            return false;
        };
        stored.job.log_lines.push(line.to_string());
        self.persist_log(job_id, line);
        true
    }

    /// Replace the job's progress. Ignored once terminal.
    pub fn update_progress(&self, job_id: &str, progress: JobProgress) -> bool {
        let mut jobs = self.write_guard();
        match jobs.get_mut(job_id) {
            Some(stored) if !stored.job.status.is_terminal() => {
                stored.job.progress = progress.normalized();
                self.persist(&stored.job);
                true
            }
            _ => false,
        }
    }

    /// Purge terminal jobs that ended more than `retention` ago, with their
    /// log files. Returns the number removed.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };

        let expired: Vec<String> = {
            let mut jobs = self.write_guard();
            let ids: Vec<String> = jobs
                .values()
                .filter(|stored| {
                    stored.job.status.is_terminal()
                        && stored.job.end_time.unwrap_or(stored.job.created_at) < cutoff
                })
                .map(|stored| stored.job.id.clone())
                .collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };

        for id in &expired {
            for path in [self.record_path(id), self.log_path(id)].into_iter().flatten() {
                if let Err(error) = remove_if_exists(&path) {
                    tracing::warn!(job_id = %id, error = %format!("{error:#}"), "failed to purge job file");
                }
            }
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "purged expired jobs");
        }
        expired.len()
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("root", &self.root)
            .field("jobs", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobOptions;

    fn job(command: &str) -> Job {
        Job::new(command, Vec::new(), JobOptions::default())
    }

    #[test]
    fn end_time_set_only_on_terminal_transition() {
        let store = JobStore::in_memory();
        let job = job("store");
        let id = job.id.clone();
        store.insert(job);

        assert!(store.mark_running(&id, Some(42)));
        let running = store.get(&id).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.pid, Some(42));
        assert!(running.end_time.is_none());

        assert!(store.finish(&id, JobStatus::Completed, None, Some(0)));
        assert!(!store.finish(&id, JobStatus::Failed, Some("late".into()), Some(1)));

        let done = store.get(&id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.end_time.unwrap() >= done.start_time.unwrap());
        assert_eq!(done.error, None);
    }

    #[test]
    fn result_is_dropped_unless_completed() {
        let store = JobStore::in_memory();
        let job = job("store");
        let id = job.id.clone();
        store.insert(job);
        store.mark_running(&id, None);
        assert!(store.set_result(&id, serde_json::json!({"blob_id": "b1"})));
        store.finish(&id, JobStatus::Failed, Some("exit 1".into()), Some(1));
        assert_eq!(store.get(&id).unwrap().result, None);
        assert!(!store.set_result(&id, serde_json::json!(1)));
    }

    #[test]
    fn progress_ignored_after_terminal() {
        let store = JobStore::in_memory();
        let job = job("sync");
        let id = job.id.clone();
        store.insert(job);
        store.mark_running(&id, None);
        assert!(store.update_progress(
            &id,
            JobProgress {
                processed: Some(1),
                total: Some(2),
                ..JobProgress::default()
            }
        ));
        assert_eq!(store.get(&id).unwrap().progress.percent, Some(50.0));
        store.finish(&id, JobStatus::Cancelled, None, None);
        assert!(!store.update_progress(&id, JobProgress::default()));
    }
}
