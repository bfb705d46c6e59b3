//! Error types for background job orchestration.

use thiserror::Error;

/// Which limit rejected a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// The dynamic global ceiling.
    Global,
    /// The command's own `max_concurrency` override.
    Command,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitScope::Global => write!(f, "global"),
            LimitScope::Command => write!(f, "command"),
        }
    }
}

/// Orchestrator errors.
#[derive(Error, Debug)]
pub enum JobError {
    /// Admission refused; the caller should queue or fail fast.
    #[error(
        "concurrency limit exceeded for '{command}': {active} running, {scope} limit {limit}{}",
        .command_limit.map(|l| format!(" (command max_concurrency {l})")).unwrap_or_default()
    )]
    ConcurrencyLimitExceeded {
        /// Rejected command.
        command: String,
        /// Limit that was hit.
        limit: usize,
        /// Jobs counted against that limit.
        active: usize,
        /// Which limit was hit.
        scope: LimitScope,
        /// The command's override, if it declares one.
        command_limit: Option<usize>,
    },

    /// Process could not be started. Not retried.
    #[error("failed to spawn '{command}': {reason}")]
    Spawn {
        /// Command that failed to start.
        command: String,
        /// OS error text.
        reason: String,
    },

    /// Unknown job id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// `wait_for_job` deadline elapsed; the job keeps running.
    #[error("timed out after {timeout_ms}ms waiting for job {job_id}")]
    WaitTimeout {
        /// Job being waited on.
        job_id: String,
        /// Wait budget.
        timeout_ms: u64,
    },

    /// The orchestrator no longer accepts work.
    #[error("orchestrator is shut down")]
    ShutDown,

    /// Job record could not be persisted.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// System metrics could not be read. Never leaves the sampler.
    #[error("resource metrics unavailable: {0}")]
    ResourceMetricsUnavailable(String),
}

impl JobError {
    /// `true` when the same submission may succeed later unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyLimitExceeded { .. } | Self::WaitTimeout { .. }
        )
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_error_names_command_limit() {
        let error = JobError::ConcurrencyLimitExceeded {
            command: "deploy".to_string(),
            limit: 1,
            active: 1,
            scope: LimitScope::Command,
            command_limit: Some(1),
        };
        let text = error.to_string();
        assert!(text.contains("'deploy'"));
        assert!(text.contains("command limit 1"));
        assert!(text.contains("max_concurrency 1"));
        assert!(error.is_transient());
    }

    #[test]
    fn spawn_error_is_not_transient() {
        let error = JobError::Spawn {
            command: "store".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert!(!error.is_transient());
    }
}
