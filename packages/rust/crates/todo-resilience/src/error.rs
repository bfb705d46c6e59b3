//! Error types for retried storage operations.

use std::collections::BTreeMap;

use thiserror::Error;

/// Retry engine errors.
///
/// Per-attempt failures never appear here; they are absorbed by the retry
/// loop and only summarized in [`RetryError::RetryBudgetExhausted`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Too few nodes are usable to attempt the operation at all.
    #[error(
        "insufficient healthy nodes for {label}: {available} of {total} usable, {required} required"
    )]
    InsufficientHealthyNodes {
        /// Operation label.
        label: String,
        /// Configured `min_nodes`.
        required: usize,
        /// Nodes that passed circuit and health filtering.
        available: usize,
        /// Nodes in the pool.
        total: usize,
    },

    /// Attempt or wall-clock budget ran out without a success.
    #[error("retry budget exhausted for {label} after {attempts} attempts in {elapsed_ms}ms: {last_error}")]
    RetryBudgetExhausted {
        /// Operation label.
        label: String,
        /// Attempts made across the whole pool.
        attempts: u32,
        /// Wall-clock time spent.
        elapsed_ms: u64,
        /// Display form of the last underlying error.
        last_error: String,
        /// Attempts made per node id.
        per_node_attempts: BTreeMap<String, u32>,
    },

    /// Invalid configuration.
    #[error("Invalid retry configuration: {0}")]
    InvalidConfig(String),
}

impl RetryError {
    /// `true` when the failure says the node pool as a whole is down, rather
    /// than that this particular operation kept failing.
    #[must_use]
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::InsufficientHealthyNodes { .. })
    }
}

/// Result type for retry operations.
pub type Result<T> = std::result::Result<T, RetryError>;
