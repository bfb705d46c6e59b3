#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use todo_events::topics;
use todo_jobs::{
    JobEvent, JobOptions, JobStatus, MetricsSource, ProcessExit, ProcessHandle, ProcessSpawner,
    Result as JobResult,
};
use todo_resilience::NodeSpec;
use todo_runtime::{RuntimeSettings, TodoRuntime};
use todo_verify::{BlobAttributes, BlobInfo, StorageClient, StorageError, VerificationOptions};

/// Process that prints its command line and exits with 0.
struct EchoProcess {
    output: Option<mpsc::Receiver<String>>,
}

#[async_trait]
impl ProcessHandle for EchoProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    async fn wait(&mut self) -> ProcessExit {
        ProcessExit::with_code(0)
    }

    async fn kill(&mut self) {}
}

struct EchoSpawner;

impl ProcessSpawner for EchoSpawner {
    fn spawn(&self, command: &str, args: &[String]) -> std::io::Result<Box<dyn ProcessHandle>> {
        let line = format!("{command} {}", args.join(" "));
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(line).expect("output buffer");
        Ok(Box::new(EchoProcess {
            output: Some(rx),
        }))
    }
}

struct IdleHost;

impl MetricsSource for IdleHost {
    fn total_memory(&self) -> JobResult<u64> {
        Ok(16 << 30)
    }

    fn free_memory(&self) -> JobResult<u64> {
        Ok(12 << 30)
    }

    fn cpu_load(&self) -> JobResult<f64> {
        Ok(0.1)
    }
}

#[derive(Default)]
struct SingleNodeStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl StorageClient for SingleNodeStore {
    async fn read_blob(&self, _node: &str, blob_id: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .lock()
            .expect("blobs lock")
            .get(blob_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(blob_id.to_string()))
    }

    async fn write_blob(
        &self,
        _node: &str,
        bytes: &[u8],
        _attributes: &BlobAttributes,
    ) -> Result<String, StorageError> {
        let mut blobs = self.blobs.lock().expect("blobs lock");
        let id = format!("blob-{}", blobs.len());
        blobs.insert(id.clone(), bytes.to_vec());
        Ok(id)
    }

    async fn get_blob_info(&self, _node: &str, blob_id: &str) -> Result<BlobInfo, StorageError> {
        let size = self
            .blobs
            .lock()
            .expect("blobs lock")
            .get(blob_id)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| StorageError::NotFound(blob_id.to_string()))?;
        Ok(BlobInfo {
            registered_epoch: 1,
            certified_epoch: Some(1),
            size,
            metadata: BlobAttributes::new(),
        })
    }

    async fn get_blob_metadata(
        &self,
        _node: &str,
        _blob_id: &str,
    ) -> Result<BlobAttributes, StorageError> {
        Ok(BlobAttributes::new())
    }

    async fn get_storage_providers(
        &self,
        _node: &str,
        _blob_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        Ok(vec!["provider-1".to_string()])
    }

    async fn verify_proof_of_availability(
        &self,
        _node: &str,
        _blob_id: &str,
    ) -> Result<bool, StorageError> {
        Ok(true)
    }
}

fn settings(store_root: Option<&TempDir>) -> RuntimeSettings {
    let mut settings = RuntimeSettings::default();
    settings.storage.nodes = vec![NodeSpec::new("node-a")];
    settings.jobs.store_root = store_root.map(|dir| dir.path().to_path_buf());
    settings.verification.require_certification = true;
    settings
}

fn start(settings: RuntimeSettings) -> TodoRuntime {
    TodoRuntime::start_with(
        settings,
        Arc::new(SingleNodeStore::default()),
        Arc::new(EchoSpawner),
        Arc::new(IdleHost),
    )
    .expect("runtime starts")
}

#[tokio::test]
async fn jobs_and_verification_share_one_runtime() {
    let dir = TempDir::new().expect("tempdir");
    let runtime = start(settings(Some(&dir)));
    let mut job_events = runtime.events().subscribe_topic("job/");

    let id = runtime
        .orchestrator()
        .submit("store", vec!["todos.json".to_string()], JobOptions::default())
        .expect("submitted");
    let job = runtime
        .orchestrator()
        .wait_for_job(&id, Duration::from_secs(5))
        .await
        .expect("job finishes");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.log_lines.iter().any(|line| line.starts_with("store")));
    assert!(dir.path().join("jobs").join(format!("{id}.json")).exists());

    let started = job_events.recv().await.expect("started event");
    assert_eq!(started.topic, topics::JOB_STARTED);
    let completed = job_events.recv().await.expect("completed event");
    assert_eq!(completed.topic, topics::JOB_COMPLETED);
    let payload: JobEvent = completed.payload_as().expect("job event payload");
    assert_eq!(payload.job_id, id);

    let options = runtime.verification_options().clone();
    let upload = runtime
        .verifier()
        .verify_upload(b"- [ ] water plants", &BlobAttributes::new(), &options)
        .await
        .expect("upload verified");
    let verified = runtime
        .verifier()
        .verify_blob(
            &upload.blob_id,
            b"- [ ] water plants",
            &BlobAttributes::new(),
            &options,
        )
        .await
        .expect("blob verified");
    assert!(verified.certified);
    assert_eq!(verified.provider_count, 1);
    assert!(runtime.engine().node_health("node-a").success_count >= 4);

    runtime.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_bus_and_refuses_jobs() {
    let runtime = start(settings(None));

    runtime.shutdown().await;
    runtime.shutdown().await;

    assert!(runtime.events().is_closed());
    assert!(
        runtime
            .orchestrator()
            .submit("sync", Vec::new(), JobOptions::default())
            .is_err()
    );
}

#[tokio::test]
async fn invalid_verification_settings_are_rejected() {
    let mut bad = settings(None);
    bad.verification = VerificationOptions {
        max_attempts: 0,
        ..VerificationOptions::default()
    };
    let error = TodoRuntime::start_with(
        bad,
        Arc::new(SingleNodeStore::default()),
        Arc::new(EchoSpawner),
        Arc::new(IdleHost),
    )
    .expect_err("zero attempts rejected");
    assert!(error.to_string().contains("verification"));
}
