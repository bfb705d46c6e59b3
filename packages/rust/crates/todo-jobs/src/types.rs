//! Job records, typed command options and snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Background job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, no process yet.
    Pending,
    /// Process spawned.
    Running,
    /// Process exited with code 0.
    Completed,
    /// Spawn error, crash or non-zero exit.
    Failed,
    /// Cancelled by caller or shutdown.
    Cancelled,
}

impl JobStatus {
    /// `true` for completed, failed and cancelled.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where a store job writes todos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTarget {
    /// Local file only.
    Local,
    /// Decentralized storage network only.
    #[default]
    Network,
    /// Both.
    Both,
}

impl StorageTarget {
    fn as_flag(self) -> &'static str {
        match self {
            StorageTarget::Local => "local",
            StorageTarget::Network => "network",
            StorageTarget::Both => "both",
        }
    }
}

/// Sort key for list-style commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Creation time.
    Created,
    /// Priority.
    Priority,
    /// Due date.
    Due,
}

/// Per-command options. Rendered to command-line flags for the job process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOptions {
    /// Upload todos to storage.
    Store {
        /// Destination.
        #[serde(default)]
        target: StorageTarget,
        /// Todo list name.
        list: Option<String>,
        /// Todos per upload batch.
        batch_size: Option<usize>,
        /// Verify each upload after writing.
        #[serde(default)]
        verify: bool,
        /// Storage epochs to pay for.
        epochs: Option<u32>,
    },
    /// Fetch todos back from storage.
    Retrieve {
        /// Blob to read.
        blob_id: String,
        /// Local list to merge into.
        list: Option<String>,
    },
    /// Reconcile local and network copies.
    Sync {
        /// Todo list name.
        list: Option<String>,
        /// Only report differences.
        #[serde(default)]
        dry_run: bool,
    },
    /// List todos.
    List {
        /// Free-text filter.
        filter: Option<String>,
        /// Sort key.
        sort: Option<SortKey>,
    },
    /// Deploy storage contracts.
    Deploy {
        /// Target network.
        network: String,
    },
    /// Anything else, passed through as `--key value`.
    Generic {
        /// Flag name to value.
        #[serde(default)]
        flags: BTreeMap<String, String>,
    },
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::Generic {
            flags: BTreeMap::new(),
        }
    }
}

impl JobOptions {
    /// Command-line flags for the job process.
    #[must_use]
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        let push = |flags: &mut Vec<String>, name: &str, value: String| {
            flags.push(format!("--{name}"));
            flags.push(value);
        };
        match self {
            JobOptions::Store {
                target,
                list,
                batch_size,
                verify,
                epochs,
            } => {
                push(&mut flags, "storage", target.as_flag().to_string());
                if let Some(list) = list {
                    push(&mut flags, "list", list.clone());
                }
                if let Some(size) = batch_size {
                    push(&mut flags, "batch-size", size.to_string());
                }
                if let Some(epochs) = epochs {
                    push(&mut flags, "epochs", epochs.to_string());
                }
                if *verify {
                    flags.push("--verify".to_string());
                }
            }
            JobOptions::Retrieve { blob_id, list } => {
                push(&mut flags, "blob-id", blob_id.clone());
                if let Some(list) = list {
                    push(&mut flags, "list", list.clone());
                }
            }
            JobOptions::Sync { list, dry_run } => {
                if let Some(list) = list {
                    push(&mut flags, "list", list.clone());
                }
                if *dry_run {
                    flags.push("--dry-run".to_string());
                }
            }
            JobOptions::List { filter, sort } => {
                if let Some(filter) = filter {
                    push(&mut flags, "filter", filter.clone());
                }
                if let Some(sort) = sort {
                    let key = match sort {
                        SortKey::Created => "created",
                        SortKey::Priority => "priority",
                        SortKey::Due => "due",
                    };
                    push(&mut flags, "sort", key.to_string());
                }
            }
            JobOptions::Deploy { network } => push(&mut flags, "network", network.clone()),
            JobOptions::Generic { flags: extra } => {
                for (name, value) in extra {
                    push(&mut flags, name, value.clone());
                }
            }
        }
        flags
    }
}

/// Progress reported by a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percentage in `[0, 100]`.
    pub percent: Option<f64>,
    /// Items done so far.
    pub processed: Option<u64>,
    /// Items in total.
    pub total: Option<u64>,
}

impl JobProgress {
    /// Fill in a missing percentage from the counts and clamp to `[0, 100]`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.percent.is_none()
            && let (Some(processed), Some(total)) = (self.processed, self.total)
            && total > 0
        {
            #[allow(clippy::cast_precision_loss)]
            let percent = processed as f64 * 100.0 / total as f64;
            self.percent = Some(percent);
        }
        self.percent = self.percent.map(|p| p.clamp(0.0, 100.0));
        self
    }
}

/// One background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub id: String,
    /// Command class (e.g. `store`, `deploy`).
    pub command: String,
    /// Positional arguments.
    pub args: Vec<String>,
    /// Typed options.
    pub options: JobOptions,
    /// Current state.
    pub status: JobStatus,
    /// OS process id while running.
    pub pid: Option<u32>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Process start time.
    pub start_time: Option<DateTime<Utc>>,
    /// Set exactly when the status is terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Last reported progress.
    #[serde(default)]
    pub progress: JobProgress,
    /// Captured output and orchestrator notes; rebuilt from the log file on load.
    #[serde(skip)]
    pub log_lines: Vec<String>,
    /// Payload reported by a completed job.
    pub result: Option<Value>,
    /// Exit or cancellation detail for non-successful jobs.
    pub error: Option<String>,
    /// Process exit code, if it exited normally.
    pub exit_code: Option<i32>,
}

impl Job {
    /// New pending job with a random id.
    pub fn new(command: impl Into<String>, args: Vec<String>, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            args,
            options,
            status: JobStatus::Pending,
            pid: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            progress: JobProgress::default(),
            log_lines: Vec::new(),
            result: None,
            error: None,
            exit_code: None,
        }
    }

    /// Full argument vector handed to the spawner.
    #[must_use]
    pub fn process_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(self.options.to_flags());
        args
    }

    /// Time spent running, if started.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.start_time?;
        Some(self.end_time.unwrap_or_else(Utc::now) - start)
    }

    /// Compact view for listings.
    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            command: self.command.clone(),
            status: self.status,
            pid: self.pid,
            start_time: self.start_time,
            end_time: self.end_time,
            progress: self.progress,
            log_line_count: self.log_lines.len(),
            duration_ms: self.duration().map(|elapsed| elapsed.num_milliseconds()),
            error: self.error.clone(),
        }
    }
}

/// Snapshot row returned by `get_job_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Unique job id.
    pub id: String,
    /// Command class.
    pub command: String,
    /// Current state.
    pub status: JobStatus,
    /// OS process id.
    pub pid: Option<u32>,
    /// Process start time.
    pub start_time: Option<DateTime<Utc>>,
    /// Terminal time.
    pub end_time: Option<DateTime<Utc>>,
    /// Last reported progress.
    pub progress: JobProgress,
    /// Captured log lines.
    pub log_line_count: usize,
    /// Milliseconds spent running so far, or in total once terminal.
    pub duration_ms: Option<i64>,
    /// Error text for failed/cancelled jobs.
    pub error: Option<String>,
}

/// Payload of `job/*` events on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job id.
    pub job_id: String,
    /// Command class.
    pub command: String,
    /// Status at the time of the event.
    pub status: JobStatus,
    /// Latest progress.
    pub progress: JobProgress,
    /// Error text, for failed and cancelled jobs.
    pub error: Option<String>,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            command: job.command.clone(),
            status: job.status,
            progress: job.progress,
            error: job.error.clone(),
            exit_code: job.exit_code,
        }
    }
}

/// Aggregate queue/worker metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetricsSnapshot {
    /// Total jobs currently tracked.
    pub total_jobs: usize,
    /// Count by state.
    pub pending: usize,
    /// Count by state.
    pub running: usize,
    /// Count by state.
    pub completed: usize,
    /// Count by state.
    pub failed: usize,
    /// Count by state.
    pub cancelled: usize,
    /// Current dynamic ceiling.
    pub concurrency_ceiling: usize,
    /// Jobs counted against the ceiling.
    pub active_jobs: usize,
    /// Age of the longest-running job.
    pub longest_running_age_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_options_render_flags() {
        let options = JobOptions::Store {
            target: StorageTarget::Both,
            list: Some("groceries".to_string()),
            batch_size: Some(5),
            verify: true,
            epochs: None,
        };
        assert_eq!(
            options.to_flags(),
            vec![
                "--storage",
                "both",
                "--list",
                "groceries",
                "--batch-size",
                "5",
                "--verify"
            ]
        );
    }

    #[test]
    fn options_are_tagged_by_kind() {
        let json = r#"{"kind":"deploy","network":"testnet"}"#;
        let parsed: JobOptions = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            JobOptions::Deploy {
                network: "testnet".to_string()
            }
        );
    }

    #[test]
    fn progress_derives_percent_from_counts() {
        let progress = JobProgress {
            percent: None,
            processed: Some(3),
            total: Some(4),
        }
        .normalized();
        assert_eq!(progress.percent, Some(75.0));

        let clamped = JobProgress {
            percent: Some(140.0),
            ..JobProgress::default()
        }
        .normalized();
        assert_eq!(clamped.percent, Some(100.0));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn summary_reports_run_duration() {
        let mut job = Job::new("sync", Vec::new(), JobOptions::default());
        assert_eq!(job.summary().duration_ms, None);

        let start = Utc::now();
        job.start_time = Some(start);
        job.end_time = Some(start + chrono::Duration::milliseconds(1_500));
        assert_eq!(job.summary().duration_ms, Some(1_500));
    }
}
