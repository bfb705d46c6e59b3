//! todo-verify - Confirms that stored todo blobs landed correctly
//!
//! - Content checks: bytes read back must equal what was written
//! - Three independent digests (SHA-256, SHA-512, BLAKE2b)
//! - Certification polling with a hard wait budget
//! - Availability monitoring with bounded re-reads
//!
//! Storage calls run through a shared [`todo_resilience::RetryEngine`];
//! certification polling deliberately does not.

mod checksum;
mod client;
mod error;
mod manager;
mod types;

pub use checksum::Checksums;
pub use client::{BlobAttributes, BlobInfo, StorageClient, StorageError};
pub use error::{Result, VerifyError};
pub use manager::VerificationManager;
pub use types::{
    AvailabilityReport, VerificationDetails, VerificationOptions, VerificationResult,
    VerificationStage,
};
