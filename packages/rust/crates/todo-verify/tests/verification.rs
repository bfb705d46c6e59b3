#![allow(missing_docs)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use todo_resilience::{NodeSpec, RetryConfig, RetryEngine};
use todo_verify::{
    BlobAttributes, BlobInfo, Checksums, StorageClient, StorageError, VerificationManager,
    VerificationOptions, VerificationStage, VerifyError,
};

struct Blob {
    bytes: Vec<u8>,
    attributes: BlobAttributes,
}

/// In-memory storage network with scripted misbehaviour.
#[derive(Default)]
struct MemoryStore {
    blobs: Mutex<HashMap<String, Blob>>,
    next_id: AtomicU32,
    /// Info polls needed before a blob reports certification; `None` never certifies.
    certify_after: Option<u32>,
    info_calls: AtomicU32,
    reads: AtomicU32,
    /// Payloads returned by successive reads before falling back to stored bytes.
    read_script: Mutex<VecDeque<Vec<u8>>>,
    down_nodes: HashSet<String>,
    providers: Vec<String>,
    poa: bool,
}

impl MemoryStore {
    fn certifying() -> Self {
        Self {
            certify_after: Some(0),
            providers: vec!["p1".to_string(), "p2".to_string()],
            poa: true,
            ..Self::default()
        }
    }

    fn never_certifying() -> Self {
        Self {
            certify_after: None,
            ..Self::certifying()
        }
    }

    fn put(&self, id: &str, bytes: &[u8]) {
        self.blobs.lock().expect("blobs lock").insert(
            id.to_string(),
            Blob {
                bytes: bytes.to_vec(),
                attributes: BlobAttributes::new(),
            },
        );
    }

    fn script_reads(&self, payloads: &[&[u8]]) {
        let mut script = self.read_script.lock().expect("script lock");
        script.extend(payloads.iter().map(|p| p.to_vec()));
    }

    fn check_node(&self, node: &str) -> Result<(), StorageError> {
        if self.down_nodes.contains(node) {
            Err(StorageError::Unavailable(node.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageClient for MemoryStore {
    async fn read_blob(&self, node: &str, blob_id: &str) -> Result<Vec<u8>, StorageError> {
        self.check_node(node)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(payload) = self.read_script.lock().expect("script lock").pop_front() {
            return Ok(payload);
        }
        self.blobs
            .lock()
            .expect("blobs lock")
            .get(blob_id)
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(blob_id.to_string()))
    }

    async fn write_blob(
        &self,
        node: &str,
        bytes: &[u8],
        attributes: &BlobAttributes,
    ) -> Result<String, StorageError> {
        self.check_node(node)?;
        let id = format!("blob-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.blobs.lock().expect("blobs lock").insert(
            id.clone(),
            Blob {
                bytes: bytes.to_vec(),
                attributes: attributes.clone(),
            },
        );
        Ok(id)
    }

    async fn get_blob_info(&self, node: &str, blob_id: &str) -> Result<BlobInfo, StorageError> {
        self.check_node(node)?;
        let calls = self.info_calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock().expect("blobs lock");
        let blob = blobs
            .get(blob_id)
            .ok_or_else(|| StorageError::NotFound(blob_id.to_string()))?;
        let certified = self.certify_after.is_some_and(|after| calls >= after);
        Ok(BlobInfo {
            registered_epoch: 7,
            certified_epoch: certified.then_some(8),
            size: blob.bytes.len() as u64,
            metadata: blob.attributes.clone(),
        })
    }

    async fn get_blob_metadata(
        &self,
        node: &str,
        blob_id: &str,
    ) -> Result<BlobAttributes, StorageError> {
        self.check_node(node)?;
        self.blobs
            .lock()
            .expect("blobs lock")
            .get(blob_id)
            .map(|blob| blob.attributes.clone())
            .ok_or_else(|| StorageError::NotFound(blob_id.to_string()))
    }

    async fn get_storage_providers(
        &self,
        node: &str,
        _blob_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        self.check_node(node)?;
        Ok(self.providers.clone())
    }

    async fn verify_proof_of_availability(
        &self,
        node: &str,
        _blob_id: &str,
    ) -> Result<bool, StorageError> {
        self.check_node(node)?;
        Ok(self.poa)
    }
}

fn engine(nodes: &[&str]) -> Arc<RetryEngine> {
    Arc::new(
        RetryEngine::new(
            RetryConfig {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                max_retries: 4,
                ..RetryConfig::default()
            },
            nodes.iter().map(|id| NodeSpec::new(*id)).collect(),
        )
        .expect("valid retry config"),
    )
}

fn manager(store: &Arc<MemoryStore>) -> VerificationManager {
    VerificationManager::new(Arc::clone(store) as Arc<dyn StorageClient>, engine(&["a", "b"]))
}

fn attrs(pairs: &[(&str, &str)]) -> BlobAttributes {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

const TODOS: &[u8] = br#"[{"id":1,"title":"buy milk","done":false}]"#;

#[tokio::test(start_paused = true)]
async fn upload_then_verify_round_trip() {
    let store = Arc::new(MemoryStore::certifying());
    let manager = manager(&store);
    let attributes = attrs(&[("content-type", "application/json"), ("list", "groceries")]);

    let upload = manager
        .verify_upload(TODOS, &attributes, &VerificationOptions::default())
        .await
        .expect("upload verifies");
    assert!(upload.success);
    assert!(upload.certified);
    assert_eq!(upload.checksums, Checksums::compute(TODOS));

    let verified = manager
        .verify_blob(
            &upload.blob_id,
            TODOS,
            &attributes,
            &VerificationOptions {
                require_certification: true,
                verify_attributes: true,
                ..VerificationOptions::default()
            },
        )
        .await
        .expect("round trip verifies");

    assert!(verified.success);
    assert!(verified.certified);
    assert!(verified.proof_of_availability_complete);
    assert_eq!(verified.provider_count, 2);
    assert!(verified.details.attributes_verified);
    assert!(!verified.details.size_mismatch);
    assert_eq!(
        verified.details.stages,
        vec![
            VerificationStage::Started,
            VerificationStage::ContentFetched,
            VerificationStage::CertificationChecked,
            VerificationStage::Certified,
            VerificationStage::ProviderChecked,
            VerificationStage::Success,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn altered_content_is_a_non_retryable_mismatch() {
    let store = Arc::new(MemoryStore::certifying());
    store.put("blob-x", b"tampered");
    let manager = manager(&store);

    let error = manager
        .verify_blob("blob-x", TODOS, &BlobAttributes::new(), &VerificationOptions::default())
        .await
        .expect_err("content differs");

    assert!(error.is_corruption());
    match error {
        VerifyError::ContentMismatch {
            expected_size,
            actual_size,
            expected_sha256,
            actual_sha256,
            ..
        } => {
            assert_eq!(expected_size, TODOS.len() as u64);
            assert_eq!(actual_size, 8);
            assert_eq!(expected_sha256, Checksums::compute(TODOS).sha256);
            assert_eq!(actual_sha256, Checksums::compute(b"tampered").sha256);
        }
        other => panic!("expected ContentMismatch, got {other:?}"),
    }
    assert_eq!(store.reads.load(Ordering::SeqCst), 1, "mismatch is not retried");
}

#[tokio::test(start_paused = true)]
async fn missing_certification_only_fails_when_required() {
    let store = Arc::new(MemoryStore::never_certifying());
    store.put("blob-u", TODOS);
    let manager = manager(&store);

    let lenient = manager
        .verify_blob("blob-u", TODOS, &BlobAttributes::new(), &VerificationOptions::default())
        .await
        .expect("certification optional");
    assert!(lenient.success);
    assert!(!lenient.certified);

    let strict = manager
        .verify_blob(
            "blob-u",
            TODOS,
            &BlobAttributes::new(),
            &VerificationOptions {
                require_certification: true,
                ..VerificationOptions::default()
            },
        )
        .await
        .expect_err("certification required");
    assert!(strict.is_not_finalized());
    assert!(matches!(
        strict,
        VerifyError::NotCertified {
            registered_epoch: 7,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn certification_wait_times_out_after_budget() {
    let store = Arc::new(MemoryStore::never_certifying());
    let manager = manager(&store);
    let options = VerificationOptions {
        wait_for_certification: true,
        wait_timeout_ms: 5_000,
        interval_ms: 500,
        ..VerificationOptions::default()
    };

    let started = tokio::time::Instant::now();
    let error = manager
        .verify_upload(TODOS, &BlobAttributes::new(), &options)
        .await
        .expect_err("never certified");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(5_000), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(5_500), "overran budget: {elapsed:?}");
    match error {
        VerifyError::CertificationTimeout {
            waited_ms, polls, ..
        } => {
            assert!(waited_ms >= 5_000);
            assert_eq!(polls, 10);
        }
        other => panic!("expected CertificationTimeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn certification_wait_returns_once_certified() {
    let store = Arc::new(MemoryStore {
        certify_after: Some(3),
        ..MemoryStore::certifying()
    });
    let manager = manager(&store);

    let result = manager
        .verify_upload(
            TODOS,
            &BlobAttributes::new(),
            &VerificationOptions {
                wait_for_certification: true,
                interval_ms: 200,
                ..VerificationOptions::default()
            },
        )
        .await
        .expect("certified while polling");

    assert!(result.certified);
    assert_eq!(result.details.certified_epoch, Some(8));
    assert_eq!(result.details.certification_polls, 3);
    assert!(
        result
            .details
            .stages
            .contains(&VerificationStage::CertificationPending)
    );
}

#[tokio::test(start_paused = true)]
async fn attribute_mismatch_is_reported() {
    let store = Arc::new(MemoryStore::certifying());
    let manager = manager(&store);
    let upload = manager
        .verify_upload(TODOS, &attrs(&[("list", "groceries")]), &VerificationOptions::default())
        .await
        .expect("upload verifies");

    let error = manager
        .verify_blob(
            &upload.blob_id,
            TODOS,
            &attrs(&[("list", "work")]),
            &VerificationOptions {
                verify_attributes: true,
                ..VerificationOptions::default()
            },
        )
        .await
        .expect_err("attribute differs");
    match error {
        VerifyError::AttributeMismatch {
            key,
            expected,
            actual,
            ..
        } => {
            assert_eq!(key, "list");
            assert_eq!(expected, "work");
            assert_eq!(actual.as_deref(), Some("groceries"));
        }
        other => panic!("expected AttributeMismatch, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn required_proof_of_availability_fails_when_incomplete() {
    let store = Arc::new(MemoryStore {
        poa: false,
        ..MemoryStore::certifying()
    });
    store.put("blob-p", TODOS);
    let manager = manager(&store);

    let lenient = manager
        .verify_blob("blob-p", TODOS, &BlobAttributes::new(), &VerificationOptions::default())
        .await
        .expect("PoA optional");
    assert!(!lenient.proof_of_availability_complete);

    let strict = manager
        .verify_blob(
            "blob-p",
            TODOS,
            &BlobAttributes::new(),
            &VerificationOptions {
                require_proof_of_availability: true,
                ..VerificationOptions::default()
            },
        )
        .await;
    assert!(matches!(
        strict,
        Err(VerifyError::ProofOfAvailabilityIncomplete { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn monitor_succeeds_on_second_attempt() {
    let store = Arc::new(MemoryStore::certifying());
    store.put("blob-m", TODOS);
    store.script_reads(&[b"partial"]);
    let manager = manager(&store);

    let report = manager
        .monitor_blob_availability(
            "blob-m",
            &Checksums::compute(TODOS),
            &VerificationOptions {
                max_attempts: 2,
                interval_ms: 100,
                ..VerificationOptions::default()
            },
        )
        .await
        .expect("second read matches");

    assert_eq!(report.attempts, 2);
    assert_eq!(store.reads.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn monitor_fails_after_all_attempts_mismatch() {
    let store = Arc::new(MemoryStore::certifying());
    store.put("blob-m", b"corrupted forever");
    let manager = manager(&store);

    let error = manager
        .monitor_blob_availability(
            "blob-m",
            &Checksums::compute(TODOS),
            &VerificationOptions {
                max_attempts: 2,
                interval_ms: 100,
                ..VerificationOptions::default()
            },
        )
        .await
        .expect_err("never matches");

    match error {
        VerifyError::AvailabilityMonitoringFailed {
            attempts,
            last_mismatch,
            ..
        } => {
            assert_eq!(attempts, 2);
            assert!(last_mismatch.contains("sha256"));
            assert!(last_mismatch.contains(&Checksums::compute(b"corrupted forever").sha256));
        }
        other => panic!("expected AvailabilityMonitoringFailed, got {other:?}"),
    }
    assert_eq!(store.reads.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn reads_fail_over_to_healthy_node() {
    let store = Arc::new(MemoryStore {
        down_nodes: HashSet::from(["a".to_string()]),
        ..MemoryStore::certifying()
    });
    store.put("blob-f", TODOS);
    let manager = manager(&store);

    let result = manager
        .verify_blob("blob-f", TODOS, &BlobAttributes::new(), &VerificationOptions::default())
        .await
        .expect("node b serves");
    assert!(result.success);

    let health = manager.engine().node_health("a");
    assert!(health.failure_count >= 1);
    assert!(health.health_score < manager.engine().node_health("b").health_score);
}
