//! Verification of blobs written to the storage network.

use std::sync::Arc;

use tokio::time::Instant;
use todo_resilience::{CircuitState, RetryEngine};

use crate::checksum::Checksums;
use crate::client::{BlobAttributes, BlobInfo, StorageClient};
use crate::error::{Result, VerifyError};
use crate::types::{
    AvailabilityReport, VerificationDetails, VerificationOptions, VerificationResult,
    VerificationStage,
};

fn byte_len(bytes: &[u8]) -> u64 {
    u64::try_from(bytes.len()).unwrap_or(u64::MAX)
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Stages passed by one call, traced as they happen.
struct StageTrail {
    blob_id: String,
    stages: Vec<VerificationStage>,
}

impl StageTrail {
    fn new(blob_id: &str) -> Self {
        let mut trail = Self {
            blob_id: blob_id.to_string(),
            stages: Vec::new(),
        };
        trail.enter(VerificationStage::Started);
        trail
    }

    fn enter(&mut self, stage: VerificationStage) {
        tracing::debug!(blob_id = %self.blob_id, %stage, "verification stage");
        self.stages.push(stage);
    }
}

/// Checks that stored blobs are retrievable, byte-identical and certified.
///
/// Stateless across calls; storage calls go through the shared
/// [`RetryEngine`], so node health is shared with every other user of it.
pub struct VerificationManager {
    client: Arc<dyn StorageClient>,
    engine: Arc<RetryEngine>,
}

impl VerificationManager {
    /// Manager over `client`, retrying through `engine`.
    pub fn new(client: Arc<dyn StorageClient>, engine: Arc<RetryEngine>) -> Self {
        Self { client, engine }
    }

    /// Shared retry engine.
    pub fn engine(&self) -> &Arc<RetryEngine> {
        &self.engine
    }

    /// Read `blob_id` back and check it against `expected` and
    /// `expected_attributes`.
    ///
    /// # Errors
    ///
    /// - [`VerifyError::ContentMismatch`] when the bytes differ (not retried).
    /// - [`VerifyError::NotCertified`] when certification is required and missing.
    /// - [`VerifyError::AttributeMismatch`] when `verify_attributes` is set and
    ///   a declared attribute differs.
    /// - [`VerifyError::NoProviders`] / [`VerifyError::ProofOfAvailabilityIncomplete`]
    ///   only when required by `options`.
    /// - [`VerifyError::Retry`] when the network could not be reached.
    pub async fn verify_blob(
        &self,
        blob_id: &str,
        expected: &[u8],
        expected_attributes: &BlobAttributes,
        options: &VerificationOptions,
    ) -> Result<VerificationResult> {
        options.validate()?;
        let mut trail = StageTrail::new(blob_id);

        let client = &self.client;
        let actual = self
            .engine
            .execute("read_blob", |node| async move {
                client.read_blob(&node, blob_id).await
            })
            .await?;
        trail.enter(VerificationStage::ContentFetched);

        let checksums = Checksums::compute(expected);
        if actual != expected {
            trail.enter(VerificationStage::ContentMismatch);
            let actual_sha256 = Checksums::compute(&actual).sha256;
            tracing::warn!(
                blob_id,
                expected = %checksums.short(),
                actual = %actual_sha256.get(..12).unwrap_or(&actual_sha256),
                "blob content mismatch"
            );
            return Err(VerifyError::ContentMismatch {
                blob_id: blob_id.to_string(),
                expected_size: byte_len(expected),
                actual_size: byte_len(&actual),
                expected_sha256: checksums.sha256,
                actual_sha256,
            });
        }

        let info = self.blob_info(blob_id).await?;
        trail.enter(VerificationStage::CertificationChecked);
        if info.is_certified() {
            trail.enter(VerificationStage::Certified);
        } else if options.require_certification {
            trail.enter(VerificationStage::NotCertified);
            return Err(VerifyError::NotCertified {
                blob_id: blob_id.to_string(),
                registered_epoch: info.registered_epoch,
            });
        }

        let attributes_verified = if options.verify_attributes {
            self.check_attributes(blob_id, expected_attributes).await?;
            true
        } else {
            false
        };

        let (provider_count, poa_complete) = self.provider_status(blob_id, options).await?;
        trail.enter(VerificationStage::ProviderChecked);
        trail.enter(VerificationStage::Success);

        let details = VerificationDetails {
            expected_size: byte_len(expected),
            actual_size: byte_len(&actual),
            reported_size: Some(info.size),
            size_mismatch: info.size != byte_len(expected),
            registered_epoch: Some(info.registered_epoch),
            certified_epoch: info.certified_epoch,
            attributes_verified,
            certification_polls: 0,
            stages: trail.stages,
        };
        if details.size_mismatch {
            tracing::warn!(blob_id, reported = info.size, actual = details.actual_size, "reported blob size differs");
        }
        tracing::info!(blob_id, certified = info.is_certified(), provider_count, "blob verified");

        Ok(VerificationResult {
            blob_id: blob_id.to_string(),
            success: true,
            checksums,
            certified: info.is_certified(),
            proof_of_availability_complete: poa_complete,
            provider_count,
            details,
        })
    }

    /// Write `bytes` and confirm the upload, optionally waiting for
    /// certification.
    ///
    /// # Errors
    ///
    /// - [`VerifyError::CertificationTimeout`] when `wait_for_certification`
    ///   is set and no certification arrives within `wait_timeout_ms`.
    /// - [`VerifyError::NotCertified`] when certification is required, missing,
    ///   and waiting is off.
    /// - [`VerifyError::Retry`] when the write or info query cannot complete.
    pub async fn verify_upload(
        &self,
        bytes: &[u8],
        attributes: &BlobAttributes,
        options: &VerificationOptions,
    ) -> Result<VerificationResult> {
        options.validate()?;
        let checksums = Checksums::compute(bytes);
        let mut trail = StageTrail::new(checksums.short());

        let client = &self.client;
        let blob_id = self
            .engine
            .execute("write_blob", |node| async move {
                client.write_blob(&node, bytes, attributes).await
            })
            .await?;
        trail.blob_id.clone_from(&blob_id);
        trail.enter(VerificationStage::ContentFetched);

        let mut info = self.blob_info(&blob_id).await?;
        trail.enter(VerificationStage::CertificationChecked);

        let mut polls = 0;
        if !info.is_certified() {
            if options.wait_for_certification {
                trail.enter(VerificationStage::CertificationPending);
                match self.await_certification(&blob_id, options).await {
                    Ok((certified, issued)) => {
                        info = certified;
                        polls = issued;
                    }
                    Err(error) => {
                        trail.enter(VerificationStage::CertificationTimeout);
                        tracing::warn!(blob_id = %blob_id, %error, "certification wait failed");
                        return Err(error);
                    }
                }
            } else if options.require_certification {
                trail.enter(VerificationStage::NotCertified);
                return Err(VerifyError::NotCertified {
                    blob_id,
                    registered_epoch: info.registered_epoch,
                });
            }
        }
        if info.is_certified() {
            trail.enter(VerificationStage::Certified);
        }
        trail.enter(VerificationStage::Success);
        tracing::info!(blob_id = %blob_id, certified = info.is_certified(), polls, "upload verified");

        let size = byte_len(bytes);
        Ok(VerificationResult {
            blob_id,
            success: true,
            checksums,
            certified: info.is_certified(),
            proof_of_availability_complete: false,
            provider_count: 0,
            details: VerificationDetails {
                expected_size: size,
                actual_size: size,
                reported_size: Some(info.size),
                size_mismatch: info.size != size,
                registered_epoch: Some(info.registered_epoch),
                certified_epoch: info.certified_epoch,
                attributes_verified: false,
                certification_polls: polls,
                stages: trail.stages,
            },
        })
    }

    /// Re-read `blob_id` until its digests match `checksums`, up to
    /// `max_attempts` reads spaced by `interval_ms`.
    ///
    /// # Errors
    ///
    /// [`VerifyError::AvailabilityMonitoringFailed`] when no attempt matches;
    /// unreadable attempts count as mismatches.
    pub async fn monitor_blob_availability(
        &self,
        blob_id: &str,
        checksums: &Checksums,
        options: &VerificationOptions,
    ) -> Result<AvailabilityReport> {
        options.validate()?;
        let client = &self.client;
        let mut last_mismatch = String::from("no read completed");

        for attempt in 1..=options.max_attempts {
            let read = self
                .engine
                .execute("monitor_read_blob", |node| async move {
                    client.read_blob(&node, blob_id).await
                })
                .await;
            match read {
                Ok(bytes) => {
                    let observed = Checksums::compute(&bytes);
                    let differing = observed.mismatches(checksums);
                    if differing.is_empty() {
                        tracing::debug!(blob_id, attempt, "blob available");
                        return Ok(AvailabilityReport {
                            blob_id: blob_id.to_string(),
                            attempts: attempt,
                            checksums: observed,
                        });
                    }
                    last_mismatch = format!(
                        "{} differ (expected sha256 {}, got {})",
                        differing.join(", "),
                        checksums.sha256,
                        observed.sha256
                    );
                }
                Err(error) => {
                    last_mismatch = format!("read failed: {error}");
                }
            }
            tracing::warn!(blob_id, attempt, max_attempts = options.max_attempts, detail = %last_mismatch, "availability check failed");

            if attempt < options.max_attempts {
                tokio::time::sleep(options.interval()).await;
            }
        }

        Err(VerifyError::AvailabilityMonitoringFailed {
            blob_id: blob_id.to_string(),
            attempts: options.max_attempts,
            last_mismatch,
        })
    }

    async fn blob_info(&self, blob_id: &str) -> Result<BlobInfo> {
        let client = &self.client;
        Ok(self
            .engine
            .execute("get_blob_info", |node| async move {
                client.get_blob_info(&node, blob_id).await
            })
            .await?)
    }

    async fn check_attributes(&self, blob_id: &str, expected: &BlobAttributes) -> Result<()> {
        let client = &self.client;
        let stored = self
            .engine
            .execute("get_blob_metadata", |node| async move {
                client.get_blob_metadata(&node, blob_id).await
            })
            .await?;
        for (key, value) in expected {
            let actual = stored.get(key);
            if actual != Some(value) {
                tracing::warn!(blob_id, key = %key, "blob attribute mismatch");
                return Err(VerifyError::AttributeMismatch {
                    blob_id: blob_id.to_string(),
                    key: key.clone(),
                    expected: value.clone(),
                    actual: actual.cloned(),
                });
            }
        }
        Ok(())
    }

    async fn provider_status(
        &self,
        blob_id: &str,
        options: &VerificationOptions,
    ) -> Result<(usize, bool)> {
        let client = &self.client;

        let providers = match self
            .engine
            .execute("get_storage_providers", |node| async move {
                client.get_storage_providers(&node, blob_id).await
            })
            .await
        {
            Ok(providers) => providers.len(),
            Err(error) if !options.require_providers => {
                tracing::warn!(blob_id, %error, "provider lookup failed");
                0
            }
            Err(error) => return Err(error.into()),
        };
        if options.require_providers && providers == 0 {
            return Err(VerifyError::NoProviders {
                blob_id: blob_id.to_string(),
            });
        }

        let poa = match self
            .engine
            .execute("verify_proof_of_availability", |node| async move {
                client.verify_proof_of_availability(&node, blob_id).await
            })
            .await
        {
            Ok(complete) => complete,
            Err(error) if !options.require_proof_of_availability => {
                tracing::warn!(blob_id, %error, "proof of availability check failed");
                false
            }
            Err(error) => return Err(error.into()),
        };
        if options.require_proof_of_availability && !poa {
            return Err(VerifyError::ProofOfAvailabilityIncomplete {
                blob_id: blob_id.to_string(),
            });
        }

        Ok((providers, poa))
    }

    /// Healthiest node whose circuit is not open; the first node otherwise.
    fn poll_node(&self) -> Option<String> {
        let nodes = self.engine.health_snapshot();
        nodes
            .iter()
            .filter(|node| node.circuit_state != CircuitState::Open)
            .reduce(|best, node| {
                if node.health_score > best.health_score {
                    node
                } else {
                    best
                }
            })
            .or_else(|| nodes.first())
            .map(|node| node.node_id.clone())
    }

    /// Poll blob info every `interval_ms` until certified or the wait budget
    /// is spent. Plain polling on one node, no retry loop.
    async fn await_certification(
        &self,
        blob_id: &str,
        options: &VerificationOptions,
    ) -> Result<(BlobInfo, u32)> {
        let started = Instant::now();
        let deadline = started + options.wait_timeout();
        let mut polls = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(VerifyError::CertificationTimeout {
                    blob_id: blob_id.to_string(),
                    waited_ms: elapsed_ms(started),
                    polls,
                });
            }
            tokio::time::sleep(options.interval().min(remaining)).await;
            polls += 1;

            let Some(node) = self.poll_node() else {
                continue;
            };
            let budget = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(budget, self.client.get_blob_info(&node, blob_id)).await {
                Ok(Ok(info)) if info.is_certified() => {
                    tracing::debug!(blob_id, polls, epoch = ?info.certified_epoch, "blob certified");
                    return Ok((info, polls));
                }
                Ok(Ok(_)) => tracing::trace!(blob_id, polls, "still uncertified"),
                Ok(Err(error)) => tracing::debug!(blob_id, node = %node, %error, "certification poll failed"),
                Err(_) => tracing::debug!(blob_id, node = %node, "certification poll timed out"),
            }
        }
    }
}

impl std::fmt::Debug for VerificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationManager")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
