//! Retry engine: one logical operation, a pool of nodes, sequential attempts.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use crate::backoff::backoff;
use crate::config::RetryConfig;
use crate::error::{Result, RetryError};
use crate::health::{NodeHealth, NodeHealthTracker, NodeSpec};

/// Executes operations against a node pool with retries, adaptive backoff and
/// per-node circuit breaking.
///
/// Health records live behind one mutex that is never held across an await;
/// concurrent `execute` calls on a shared engine see each other's outcomes.
#[derive(Debug)]
pub struct RetryEngine {
    config: RetryConfig,
    tracker: Mutex<NodeHealthTracker>,
}

impl RetryEngine {
    /// Create an engine for `nodes`.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::InvalidConfig`] when the configuration is invalid.
    pub fn new(config: RetryConfig, nodes: Vec<NodeSpec>) -> Result<Self> {
        config.validate()?;
        let tracker =
            NodeHealthTracker::new(nodes, config.circuit_breaker.clone(), config.health_window);
        Ok(Self {
            config,
            tracker: Mutex::new(tracker),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn tracker(&self) -> MutexGuard<'_, NodeHealthTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Health snapshot of every node in the pool.
    pub fn health_snapshot(&self) -> Vec<NodeHealth> {
        self.tracker().snapshot()
    }

    /// Health snapshot of one node.
    pub fn node_health(&self, node_id: &str) -> NodeHealth {
        self.tracker().health(node_id)
    }

    /// Replace the node pool; history of removed nodes is discarded.
    pub fn reset_pool(&self, nodes: Vec<NodeSpec>) {
        tracing::info!(nodes = nodes.len(), "node pool reconfigured");
        self.tracker().reconfigure(nodes);
    }

    /// Run `operation` until it succeeds or the budget runs out.
    ///
    /// The operation receives the id of the node it should target. Attempts
    /// are strictly sequential.
    ///
    /// # Errors
    ///
    /// - [`RetryError::InsufficientHealthyNodes`] as soon as fewer than
    ///   `min_nodes` nodes are usable.
    /// - [`RetryError::RetryBudgetExhausted`] when `max_retries` or
    ///   `max_duration_ms` is reached, carrying the last underlying error.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let deadline = started + self.config.max_duration();
        let mut attempts: u32 = 0;
        let mut per_node_attempts: BTreeMap<String, u32> = BTreeMap::new();
        let mut last_error = String::from("no attempt completed");

        while attempts < self.config.max_retries && Instant::now() < deadline {
            let node = self.select_node(label)?;
            attempts += 1;
            *per_node_attempts.entry(node.clone()).or_default() += 1;

            let attempt_started = Instant::now();
            let attempt_timeout = self
                .config
                .per_attempt_timeout()
                .min(deadline.saturating_duration_since(attempt_started));

            let mut pending = PendingAttempt {
                engine: self,
                node: &node,
                settled: false,
            };
            let outcome = tokio::time::timeout(attempt_timeout, operation(node.clone())).await;
            pending.settled = true;
            drop(pending);

            match outcome {
                Ok(Ok(value)) => {
                    self.tracker()
                        .record_success(&node, attempt_started.elapsed());
                    tracing::debug!(label, node = %node, attempts, "operation succeeded");
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    last_error = error.to_string();
                }
                Err(_) => {
                    last_error = format!(
                        "attempt timed out after {}ms",
                        attempt_timeout.as_millis()
                    );
                }
            }

            let (circuit, score) = {
                let mut tracker = self.tracker();
                let circuit = tracker.record_failure(&node, Instant::now());
                (circuit, tracker.health(&node).health_score)
            };
            tracing::warn!(
                label,
                node = %node,
                attempt = attempts,
                circuit = %circuit,
                health_score = score,
                error = %last_error,
                "attempt failed"
            );

            if attempts >= self.config.max_retries {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let delay = backoff(&self.config, attempts, score).min(remaining);
            tokio::time::sleep(delay).await;
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::error!(label, attempts, elapsed_ms, error = %last_error, "retry budget exhausted");
        Err(RetryError::RetryBudgetExhausted {
            label: label.to_string(),
            attempts,
            elapsed_ms,
            last_error,
            per_node_attempts,
        })
    }

    fn select_node(&self, label: &str) -> Result<String> {
        let mut tracker = self.tracker();
        let now = Instant::now();
        let total = tracker.nodes().len();
        let available = tracker.eligible_count(now, self.config.health_threshold);
        let required = self.config.min_nodes.max(1);
        if available >= required
            && let (Some(node), _) =
                tracker.select(self.config.load_balancing, now, self.config.health_threshold)
        {
            return Ok(node);
        }
        tracing::error!(label, available, total, required, "insufficient healthy nodes");
        Err(RetryError::InsufficientHealthyNodes {
            label: label.to_string(),
            required,
            available,
            total,
        })
    }
}

/// In-flight attempt. Dropped unsettled when the caller abandons `execute`
/// mid-attempt, so a half-open node is not left half-open forever.
struct PendingAttempt<'a> {
    engine: &'a RetryEngine,
    node: &'a str,
    settled: bool,
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.engine.tracker().abandon(self.node, Instant::now());
        }
    }
}
