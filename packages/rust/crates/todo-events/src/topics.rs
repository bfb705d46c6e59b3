//! Topic names. `job/` and `resource/` are the prefixes subscribers filter on.

/// Periodic resource usage sample
pub const RESOURCE_UPDATE: &str = "resource/update";
/// Concurrency ceiling changed after a sample
pub const RESOURCE_CEILING_CHANGED: &str = "resource/ceiling_changed";

/// Job process spawned
pub const JOB_STARTED: &str = "job/started";
/// Job progress reported
pub const JOB_PROGRESS: &str = "job/progress";
/// Job exited with code 0
pub const JOB_COMPLETED: &str = "job/completed";
/// Job exited non-zero or crashed
pub const JOB_FAILED: &str = "job/failed";
/// Job cancelled by caller or shutdown
pub const JOB_CANCELLED: &str = "job/cancelled";

/// Orchestrator shutting down
pub const SYSTEM_SHUTDOWN: &str = "system/shutdown";
