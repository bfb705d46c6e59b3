//! Background job orchestration for the todo storage core.
//!
//! Long storage operations run as supervised child processes. The
//! [`JobOrchestrator`] admits work against a concurrency ceiling that follows
//! host memory and CPU pressure, records every transition in a [`JobStore`],
//! and publishes resource and job events on a [`todo_events::EventBus`].
//!
//! ```rust,ignore
//! let orchestrator = JobOrchestrator::start(
//!     OrchestratorConfig::default(),
//!     Arc::new(JobStore::in_memory()),
//!     Arc::new(TokioProcessSpawner::new("todo")),
//!     Arc::new(SysinfoMetrics::new()),
//!     EventBus::new(256),
//! );
//! let id = orchestrator.submit("store", vec![], JobOptions::default())?;
//! let job = orchestrator.wait_for_job(&id, Duration::from_secs(60)).await?;
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
mod persistence;
pub mod resources;
pub mod spawner;
pub mod store;
pub mod types;

pub use config::{CEILING_CAP, CEILING_FLOOR, OrchestratorConfig};
pub use error::{JobError, LimitScope, Result};
pub use orchestrator::{CANCELLED_ERROR, JobOrchestrator};
pub use resources::{
    ConcurrencyCeiling, MetricsSource, ResourceSampler, ResourceUsage, SysinfoMetrics,
};
pub use spawner::{ProcessExit, ProcessHandle, ProcessSpawner, TokioProcessSpawner};
pub use store::{JobStore, RESTART_ERROR};
pub use types::{
    Job, JobEvent, JobMetricsSnapshot, JobOptions, JobProgress, JobStatus, JobSummary, SortKey,
    StorageTarget,
};
