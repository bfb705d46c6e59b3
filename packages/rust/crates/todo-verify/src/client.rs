//! Storage network client seam.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared blob attributes (content type, list name, owner, ...).
pub type BlobAttributes = BTreeMap<String, String>;

/// Registration and certification state of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Epoch in which the blob was registered.
    pub registered_epoch: u64,
    /// Epoch in which the blob was certified, once it is.
    pub certified_epoch: Option<u64>,
    /// Size in bytes as recorded by the network.
    pub size: u64,
    /// Attributes recorded with the blob.
    #[serde(default)]
    pub metadata: BlobAttributes,
}

impl BlobInfo {
    /// `true` once a certification epoch is recorded.
    pub fn is_certified(&self) -> bool {
        self.certified_epoch.is_some()
    }
}

/// Failure of a single storage call. Retried by the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Blob unknown to the node.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// Node unreachable or overloaded.
    #[error("node unavailable: {0}")]
    Unavailable(String),
    /// Node refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Client for the decentralized storage network. Every call targets the node
/// chosen by the retry engine.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Read blob content.
    async fn read_blob(&self, node: &str, blob_id: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `bytes` and return the new blob id.
    async fn write_blob(
        &self,
        node: &str,
        bytes: &[u8],
        attributes: &BlobAttributes,
    ) -> Result<String, StorageError>;

    /// Registration and certification state.
    async fn get_blob_info(&self, node: &str, blob_id: &str) -> Result<BlobInfo, StorageError>;

    /// Attributes recorded with the blob.
    async fn get_blob_metadata(
        &self,
        node: &str,
        blob_id: &str,
    ) -> Result<BlobAttributes, StorageError>;

    /// Storage providers holding the blob.
    async fn get_storage_providers(
        &self,
        node: &str,
        blob_id: &str,
    ) -> Result<Vec<String>, StorageError>;

    /// Whether a proof of availability is complete.
    async fn verify_proof_of_availability(
        &self,
        node: &str,
        blob_id: &str,
    ) -> Result<bool, StorageError>;
}
