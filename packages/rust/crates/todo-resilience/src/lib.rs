//! todo-resilience - Retries across storage nodes with circuit breaking
//!
//! Makes one logical storage operation reliable over a pool of unreliable
//! nodes:
//! - Node selection by health score, round-robin or priority
//! - Exponential backoff, optionally scaled by the node's health
//! - Per-node circuit breaker (closed / open / half-open)
//! - Attempt and wall-clock budgets
//!
//! # Examples
//!
//! ```rust
//! use todo_resilience::{NodeSpec, RetryConfig, RetryEngine};
//!
//! # async fn demo() -> todo_resilience::Result<()> {
//! let engine = RetryEngine::new(
//!     RetryConfig::default(),
//!     vec![NodeSpec::new("https://aggregator-a"), NodeSpec::new("https://aggregator-b")],
//! )?;
//! let bytes = engine
//!     .execute("read_blob", |node| async move {
//!         Ok::<_, std::io::Error>(format!("payload from {node}"))
//!     })
//!     .await?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod config;
mod engine;
mod error;
mod health;

pub use backoff::{backoff, compute_delay};
pub use config::{CircuitBreakerConfig, LoadBalancing, RetryConfig};
pub use engine::RetryEngine;
pub use error::{Result, RetryError};
pub use health::{CircuitState, Eligibility, NodeHealth, NodeHealthTracker, NodeSpec};
