//! Verification errors.

use thiserror::Error;
use todo_resilience::RetryError;

/// Why a verification call failed.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Stored bytes differ from what was expected. Retrying will not help.
    #[error(
        "content mismatch for blob {blob_id}: expected {expected_size} bytes (sha256 {expected_sha256}), \
         got {actual_size} bytes (sha256 {actual_sha256})"
    )]
    ContentMismatch {
        /// Blob checked.
        blob_id: String,
        /// Expected length.
        expected_size: u64,
        /// Length read back.
        actual_size: u64,
        /// Expected SHA-256.
        expected_sha256: String,
        /// SHA-256 of what was read.
        actual_sha256: String,
    },

    /// Certification was required and the blob has none yet.
    #[error("blob {blob_id} is not certified (registered in epoch {registered_epoch})")]
    NotCertified {
        /// Blob checked.
        blob_id: String,
        /// Registration epoch.
        registered_epoch: u64,
    },

    /// Certification did not arrive within the wait budget.
    #[error("blob {blob_id} not certified after {waited_ms}ms ({polls} polls)")]
    CertificationTimeout {
        /// Blob polled.
        blob_id: String,
        /// Time spent polling.
        waited_ms: u64,
        /// Polls issued.
        polls: u32,
    },

    /// A declared attribute differs from the stored one.
    #[error("attribute '{key}' of blob {blob_id}: expected {expected:?}, found {actual:?}")]
    AttributeMismatch {
        /// Blob checked.
        blob_id: String,
        /// Attribute name.
        key: String,
        /// Expected value.
        expected: String,
        /// Stored value, if any.
        actual: Option<String>,
    },

    /// Providers were required and none hold the blob.
    #[error("no storage providers hold blob {blob_id}")]
    NoProviders {
        /// Blob checked.
        blob_id: String,
    },

    /// Proof of availability was required and is incomplete.
    #[error("proof of availability incomplete for blob {blob_id}")]
    ProofOfAvailabilityIncomplete {
        /// Blob checked.
        blob_id: String,
    },

    /// Every monitoring attempt failed to read matching content.
    #[error("availability monitoring failed for blob {blob_id} after {attempts} attempts: {last_mismatch}")]
    AvailabilityMonitoringFailed {
        /// Blob monitored.
        blob_id: String,
        /// Attempts made.
        attempts: u32,
        /// What the last attempt observed.
        last_mismatch: String,
    },

    /// Storage calls exhausted the retry budget or ran out of nodes.
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// Options cannot be satisfied.
    #[error("invalid verification options: {0}")]
    InvalidOptions(String),
}

impl VerifyError {
    /// The data is wrong (corruption or wrong blob id).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ContentMismatch { .. } | Self::AttributeMismatch { .. }
        )
    }

    /// The data exists but is not finalized yet; try again later.
    #[must_use]
    pub fn is_not_finalized(&self) -> bool {
        matches!(
            self,
            Self::NotCertified { .. } | Self::CertificationTimeout { .. }
        )
    }

    /// The storage network could not be reached reliably.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Result type for verification operations.
pub type Result<T> = std::result::Result<T, VerifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_disjoint() {
        let mismatch = VerifyError::ContentMismatch {
            blob_id: "b".to_string(),
            expected_size: 3,
            actual_size: 4,
            expected_sha256: "aa".to_string(),
            actual_sha256: "bb".to_string(),
        };
        assert!(mismatch.is_corruption());
        assert!(!mismatch.is_not_finalized());
        assert!(mismatch.to_string().contains("expected 3 bytes"));

        let timeout = VerifyError::CertificationTimeout {
            blob_id: "b".to_string(),
            waited_ms: 5_000,
            polls: 10,
        };
        assert!(timeout.is_not_finalized());
        assert!(!timeout.is_network());

        let network = VerifyError::from(RetryError::InvalidConfig("x".to_string()));
        assert!(network.is_network());
    }
}
