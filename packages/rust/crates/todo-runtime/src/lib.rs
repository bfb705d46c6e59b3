//! todo-runtime - Wires the storage core together
//!
//! Reads [`RuntimeSettings`], then builds one [`EventBus`], one job store and
//! [`JobOrchestrator`], one [`RetryEngine`] over the configured storage nodes
//! and a [`VerificationManager`] sharing that engine.
//!
//! ```rust,ignore
//! todo_runtime::init_tracing("todo_jobs=info,todo_verify=info");
//! let runtime = TodoRuntime::start(load_runtime_settings(), client)?;
//! let id = runtime.orchestrator().submit("store", vec![], JobOptions::default())?;
//! runtime.shutdown().await;
//! ```

pub mod settings;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use todo_events::EventBus;
use todo_jobs::{
    JobOrchestrator, JobStore, MetricsSource, ProcessSpawner, SysinfoMetrics, TokioProcessSpawner,
};
use todo_resilience::RetryEngine;
use todo_verify::{StorageClient, VerificationManager, VerificationOptions};

pub use settings::{
    EventSettings, RuntimeSettings, StorageSettings, load_runtime_settings,
    load_runtime_settings_from_paths, runtime_settings_paths,
};
pub use telemetry::init_tracing;

/// Running storage core.
pub struct TodoRuntime {
    settings: RuntimeSettings,
    events: EventBus,
    orchestrator: Arc<JobOrchestrator>,
    engine: Arc<RetryEngine>,
    verifier: VerificationManager,
}

impl TodoRuntime {
    /// Start with real child processes and host metrics.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the job store cannot be opened or the retry settings are
    /// invalid.
    pub fn start(settings: RuntimeSettings, client: Arc<dyn StorageClient>) -> Result<Self> {
        let spawner: Arc<dyn ProcessSpawner> = match &settings.storage.program {
            Some(program) => Arc::new(TokioProcessSpawner::new(program.clone())),
            None => Arc::new(TokioProcessSpawner::direct()),
        };
        Self::start_with(settings, client, spawner, Arc::new(SysinfoMetrics::new()))
    }

    /// Start with an explicit process spawner and metrics source.
    ///
    /// # Errors
    ///
    /// Same as [`TodoRuntime::start`].
    pub fn start_with(
        settings: RuntimeSettings,
        client: Arc<dyn StorageClient>,
        spawner: Arc<dyn ProcessSpawner>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Result<Self> {
        settings
            .verification
            .validate()
            .context("invalid verification settings")?;
        let engine = Arc::new(
            RetryEngine::new(settings.retry.clone(), settings.storage.nodes.clone())
                .context("invalid retry settings")?,
        );
        if settings.storage.nodes.is_empty() {
            tracing::warn!("no storage nodes configured; storage calls will fail");
        }

        let store = match &settings.jobs.store_root {
            Some(root) => JobStore::open(root)
                .with_context(|| format!("failed to open job store at {}", root.display()))?,
            None => JobStore::in_memory(),
        };

        let events = EventBus::new(settings.events.capacity);
        let orchestrator = JobOrchestrator::start(
            settings.jobs.clone(),
            Arc::new(store),
            spawner,
            metrics,
            events.clone(),
        );
        let verifier = VerificationManager::new(client, Arc::clone(&engine));

        tracing::info!(
            nodes = settings.storage.nodes.len(),
            ceiling = orchestrator.current_ceiling(),
            "todo runtime started"
        );
        Ok(Self {
            settings,
            events,
            orchestrator,
            engine,
            verifier,
        })
    }

    /// Settings the runtime was started with.
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Default verification options from settings.
    pub fn verification_options(&self) -> &VerificationOptions {
        &self.settings.verification
    }

    /// Shared event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Job orchestrator.
    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// Retry engine shared by all storage calls.
    pub fn engine(&self) -> &Arc<RetryEngine> {
        &self.engine
    }

    /// Blob verification.
    pub fn verifier(&self) -> &VerificationManager {
        &self.verifier
    }

    /// Stop the orchestrator, then close the bus. Idempotent.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        self.events.close();
        tracing::info!("todo runtime stopped");
    }
}

impl std::fmt::Debug for TodoRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TodoRuntime")
            .field("orchestrator", &self.orchestrator)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
