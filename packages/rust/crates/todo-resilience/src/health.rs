//! Per-node health tracking and circuit breaker state machine.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                 │ reset timeout elapsed,
//!     │ probe ok                        │ node selected
//!     │                                 ▼
//!     └───────────────────────────── HalfOpen
//!                probe failed ──▶ Open
//! ```
//!
//! The health score is the success ratio over the last `window` outcomes.
//! A fresh node's window is seeded with successes, so a new node scores 1.0
//! and a couple of early failures lower the score without excluding it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{CircuitBreakerConfig, LoadBalancing};

/// Circuit breaker state for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Traffic flows normally.
    Closed,
    /// Node is skipped until the reset timeout elapses.
    Open,
    /// One probe attempt is in flight.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Snapshot of one node's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Node identifier.
    pub node_id: String,
    /// Successful attempts since the node joined the pool.
    pub success_count: u64,
    /// Failed attempts since the node joined the pool.
    pub failure_count: u64,
    /// Mean latency of successful attempts.
    pub average_latency_ms: f64,
    /// Success ratio over the rolling window, in `[0, 1]`.
    pub health_score: f64,
    /// Circuit breaker state.
    pub circuit_state: CircuitState,
    /// Wall-clock time of the last failure.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

/// A member of the node pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node identifier (URL, host name, ...).
    pub id: String,
    /// Lower values are preferred by [`LoadBalancing::Priority`].
    #[serde(default)]
    pub priority: u32,
}

impl NodeSpec {
    /// Node with priority 0.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
        }
    }

    /// Set the selection priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&str> for NodeSpec {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug)]
struct NodeRecord {
    health: NodeHealth,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

impl NodeRecord {
    fn new(node_id: &str, window: usize) -> Self {
        Self {
            health: NodeHealth {
                node_id: node_id.to_string(),
                success_count: 0,
                failure_count: 0,
                average_latency_ms: 0.0,
                health_score: 1.0,
                circuit_state: CircuitState::Closed,
                last_failure_time: None,
                consecutive_failures: 0,
            },
            window: std::iter::repeat_n(true, window).collect(),
            opened_at: None,
            last_failure_at: None,
        }
    }

    fn push_outcome(&mut self, success: bool, capacity: usize) {
        self.window.push_back(success);
        while self.window.len() > capacity {
            self.window.pop_front();
        }
        let successes = self.window.iter().filter(|ok| **ok).count();
        #[allow(clippy::cast_precision_loss)]
        let score = successes as f64 / self.window.len().max(1) as f64;
        self.health.health_score = score.clamp(0.0, 1.0);
    }
}

/// How a node qualified for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Closed circuit and healthy enough.
    Ready,
    /// Open circuit whose reset timeout elapsed, or a low-scoring node whose
    /// last failure is older than the reset timeout; the next attempt probes it.
    Probe,
}

/// Per-pool health records. Owned by exactly one retry engine.
#[derive(Debug)]
pub struct NodeHealthTracker {
    nodes: Vec<NodeSpec>,
    records: HashMap<String, NodeRecord>,
    circuit: CircuitBreakerConfig,
    window: usize,
    cursor: usize,
}

impl NodeHealthTracker {
    /// Create a tracker for `nodes`. Records are created lazily.
    pub fn new(nodes: Vec<NodeSpec>, circuit: CircuitBreakerConfig, window: usize) -> Self {
        Self {
            nodes,
            records: HashMap::new(),
            circuit,
            window: window.max(1),
            cursor: 0,
        }
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Replace the pool. Records for nodes no longer present are dropped;
    /// surviving nodes keep their history.
    pub fn reconfigure(&mut self, nodes: Vec<NodeSpec>) {
        self.records
            .retain(|id, _| nodes.iter().any(|node| &node.id == id));
        self.nodes = nodes;
        self.cursor = 0;
    }

    fn record_mut(&mut self, node_id: &str) -> &mut NodeRecord {
        let window = self.window;
        self.records
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRecord::new(node_id, window))
    }

    /// Snapshot of one node (a fresh record if the node was never used).
    pub fn health(&self, node_id: &str) -> NodeHealth {
        self.records.get(node_id).map_or_else(
            || NodeRecord::new(node_id, self.window).health,
            |record| record.health.clone(),
        )
    }

    /// Snapshots of every node in declaration order.
    pub fn snapshot(&self) -> Vec<NodeHealth> {
        self.nodes.iter().map(|node| self.health(&node.id)).collect()
    }

    /// Whether `node_id` may be selected at `now`.
    pub fn eligibility(
        &self,
        node_id: &str,
        now: Instant,
        health_threshold: f64,
    ) -> Option<Eligibility> {
        let Some(record) = self.records.get(node_id) else {
            return Some(Eligibility::Ready);
        };
        let reset = self.circuit.reset_timeout();
        match record.health.circuit_state {
            CircuitState::HalfOpen => None,
            CircuitState::Open => {
                elapsed_at_least(record.opened_at, now, reset).then_some(Eligibility::Probe)
            }
            CircuitState::Closed if record.health.health_score >= health_threshold => {
                Some(Eligibility::Ready)
            }
            CircuitState::Closed => {
                elapsed_at_least(record.last_failure_at, now, reset).then_some(Eligibility::Probe)
            }
        }
    }

    /// Number of nodes that may be selected at `now`.
    pub fn eligible_count(&self, now: Instant, health_threshold: f64) -> usize {
        self.nodes
            .iter()
            .filter(|node| self.eligibility(&node.id, now, health_threshold).is_some())
            .count()
    }

    /// Pick the next node among the eligible ones.
    ///
    /// Returns the chosen node id and the number of eligible nodes. A chosen
    /// open node moves to half-open.
    pub fn select(
        &mut self,
        strategy: LoadBalancing,
        now: Instant,
        health_threshold: f64,
    ) -> (Option<String>, usize) {
        let eligible: Vec<(usize, Eligibility)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| {
                self.eligibility(&node.id, now, health_threshold)
                    .map(|eligibility| (index, eligibility))
            })
            .collect();
        if eligible.is_empty() {
            return (None, 0);
        }

        let chosen = match strategy {
            LoadBalancing::Health => eligible
                .iter()
                .map(|(index, _)| *index)
                .min_by(|a, b| {
                    let ha = self.health(&self.nodes[*a].id);
                    let hb = self.health(&self.nodes[*b].id);
                    hb.health_score
                        .total_cmp(&ha.health_score)
                        .then(ha.average_latency_ms.total_cmp(&hb.average_latency_ms))
                        .then(a.cmp(b))
                }),
            LoadBalancing::Priority => eligible
                .iter()
                .map(|(index, _)| *index)
                .min_by_key(|index| (self.nodes[*index].priority, *index)),
            LoadBalancing::RoundRobin => {
                let len = self.nodes.len();
                let start = self.cursor % len;
                let picked = (0..len)
                    .map(|offset| (start + offset) % len)
                    .find(|index| eligible.iter().any(|(e, _)| e == index));
                if let Some(index) = picked {
                    self.cursor = index + 1;
                }
                picked
            }
        };

        let Some(index) = chosen else {
            return (None, eligible.len());
        };
        let node_id = self.nodes[index].id.clone();
        let probing = eligible
            .iter()
            .any(|(e, kind)| *e == index && *kind == Eligibility::Probe);
        let record = self.record_mut(&node_id);
        if probing && record.health.circuit_state == CircuitState::Open {
            record.health.circuit_state = CircuitState::HalfOpen;
            tracing::debug!(node = %node_id, "circuit half-open, probing node");
        }
        (Some(node_id), eligible.len())
    }

    /// Record a successful attempt.
    pub fn record_success(&mut self, node_id: &str, latency: Duration) {
        let window = self.window;
        let record = self.record_mut(node_id);
        record.health.success_count += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = record.health.success_count as f64;
        let latency_ms = latency.as_secs_f64() * 1_000.0;
        record.health.average_latency_ms += (latency_ms - record.health.average_latency_ms) / n;
        record.health.consecutive_failures = 0;
        record.push_outcome(true, window);
        if record.health.circuit_state != CircuitState::Closed {
            tracing::info!(node = %node_id, "circuit closed after successful probe");
        }
        record.health.circuit_state = CircuitState::Closed;
        record.opened_at = None;
    }

    /// Record a failed attempt. Returns the resulting circuit state.
    pub fn record_failure(&mut self, node_id: &str, now: Instant) -> CircuitState {
        let window = self.window;
        let threshold = self.circuit.failure_threshold;
        let record = self.record_mut(node_id);
        record.health.failure_count += 1;
        record.health.consecutive_failures = record.health.consecutive_failures.saturating_add(1);
        record.health.last_failure_time = Some(Utc::now());
        record.last_failure_at = Some(now);
        record.push_outcome(false, window);

        let was = record.health.circuit_state;
        let open = was == CircuitState::HalfOpen
            || record.health.consecutive_failures >= threshold;
        if open {
            record.health.circuit_state = CircuitState::Open;
            record.opened_at = Some(now);
            if was != CircuitState::Open {
                tracing::warn!(
                    node = %node_id,
                    consecutive_failures = record.health.consecutive_failures,
                    from = %was,
                    "circuit opened"
                );
            }
        }
        record.health.circuit_state
    }

    /// An attempt on `node_id` ended without an outcome (its future was
    /// dropped). A half-open node goes back to open with a fresh reset
    /// timer so it can be probed again; other states are left alone.
    pub fn abandon(&mut self, node_id: &str, now: Instant) {
        let Some(record) = self.records.get_mut(node_id) else {
            return;
        };
        if record.health.circuit_state == CircuitState::HalfOpen {
            record.health.circuit_state = CircuitState::Open;
            record.opened_at = Some(now);
            tracing::debug!(node = %node_id, "half-open attempt abandoned, circuit re-opened");
        }
    }
}

fn elapsed_at_least(since: Option<Instant>, now: Instant, wait: Duration) -> bool {
    since.is_none_or(|at| now.saturating_duration_since(at) >= wait)
}
