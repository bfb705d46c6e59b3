//! Options, results and lifecycle stages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::Checksums;
use crate::error::{Result, VerifyError};

/// Knobs for one verification call. Also the `verification` settings section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationOptions {
    /// Fail with `NotCertified` when the blob has no certification epoch.
    pub require_certification: bool,
    /// Compare declared attributes with the stored metadata.
    pub verify_attributes: bool,
    /// Fail when no provider holds the blob.
    pub require_providers: bool,
    /// Fail when the proof of availability is incomplete.
    pub require_proof_of_availability: bool,
    /// After an upload, poll until certified or `wait_timeout_ms` elapses.
    pub wait_for_certification: bool,
    /// Poll and monitoring interval.
    pub interval_ms: u64,
    /// Certification wait budget.
    pub wait_timeout_ms: u64,
    /// Reads made by availability monitoring before giving up.
    pub max_attempts: u32,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self {
            require_certification: false,
            verify_attributes: false,
            require_providers: false,
            require_proof_of_availability: false,
            wait_for_certification: false,
            interval_ms: 1_000,
            wait_timeout_ms: 60_000,
            max_attempts: 3,
        }
    }
}

impl VerificationOptions {
    /// Reject options that cannot terminate.
    ///
    /// # Errors
    ///
    /// [`VerifyError::InvalidOptions`] for a zero interval or zero attempts.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(VerifyError::InvalidOptions(
                "interval_ms must be > 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(VerifyError::InvalidOptions(
                "max_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub(crate) fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Verification lifecycle. `ContentMismatch`, `NotCertified` and
/// `CertificationTimeout` are terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    /// Call accepted.
    Started,
    /// Content read back (or written, for uploads).
    ContentFetched,
    /// Content differs from the expectation.
    ContentMismatch,
    /// Blob info queried.
    CertificationChecked,
    /// Certification required and missing.
    NotCertified,
    /// Waiting for certification.
    CertificationPending,
    /// Certification epoch present.
    Certified,
    /// Certification did not arrive in time.
    CertificationTimeout,
    /// Providers and proof of availability queried.
    ProviderChecked,
    /// All checks passed.
    Success,
}

impl VerificationStage {
    /// `true` for the failure stages.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ContentMismatch | Self::NotCertified | Self::CertificationTimeout
        )
    }
}

impl std::fmt::Display for VerificationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::ContentFetched => "content_fetched",
            Self::ContentMismatch => "content_mismatch",
            Self::CertificationChecked => "certification_checked",
            Self::NotCertified => "not_certified",
            Self::CertificationPending => "certification_pending",
            Self::Certified => "certified",
            Self::CertificationTimeout => "certification_timeout",
            Self::ProviderChecked => "provider_checked",
            Self::Success => "success",
        };
        f.write_str(name)
    }
}

/// Sizes, epochs and the stages a call went through.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerificationDetails {
    /// Length of the expected (or uploaded) content.
    pub expected_size: u64,
    /// Length actually read back; equals `expected_size` for uploads.
    pub actual_size: u64,
    /// Size recorded by the network.
    pub reported_size: Option<u64>,
    /// `reported_size` differs from `expected_size`.
    pub size_mismatch: bool,
    /// Registration epoch.
    pub registered_epoch: Option<u64>,
    /// Certification epoch.
    pub certified_epoch: Option<u64>,
    /// Attributes were compared and matched.
    pub attributes_verified: bool,
    /// Certification polls issued.
    pub certification_polls: u32,
    /// Stages passed, in order.
    pub stages: Vec<VerificationStage>,
}

/// Outcome of `verify_blob` or `verify_upload`. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Blob verified.
    pub blob_id: String,
    /// All required checks passed.
    pub success: bool,
    /// Digests of the expected content.
    pub checksums: Checksums,
    /// A certification epoch is recorded.
    pub certified: bool,
    /// Proof of availability complete.
    pub proof_of_availability_complete: bool,
    /// Providers holding the blob.
    pub provider_count: usize,
    /// Structured detail.
    pub details: VerificationDetails,
}

/// Outcome of `monitor_blob_availability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    /// Blob monitored.
    pub blob_id: String,
    /// Reads made, including the matching one.
    pub attempts: u32,
    /// Digests that matched.
    pub checksums: Checksums,
}
