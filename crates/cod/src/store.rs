//! The object-store seam. The engine requires a blob store with generation
//! disclosure on reads, `if-generation-match` preconditions on writes,
//! prefix listing, and per-blob content-encoding and storage class. Real
//! backends live outside this crate; [`mem::MemStore`] backs the test suite.

pub mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("generation precondition failed for {0}")]
    PreconditionFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Tiered retention classes, applied per blob on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageClass {
    Standard,
    Nearline,
    Coldline,
    Archive,
}

impl Default for StorageClass {
    fn default() -> Self {
        StorageClass::Standard
    }
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::Nearline => "NEARLINE",
            StorageClass::Coldline => "COLDLINE",
            StorageClass::Archive => "ARCHIVE",
        }
    }
}

/// Server-side facts about a stored blob.
#[derive(Debug, Clone, Default)]
pub struct BlobMeta {
    /// Monotonic version number assigned by the store on each write.
    pub generation: i64,
    pub size: u64,
    /// Base64 of the big-endian CRC32C of the blob content, when the
    /// backend discloses it.
    pub crc32c: Option<String>,
    pub storage_class: StorageClass,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// `Some(0)` means "create only if absent"; any other value requires the
    /// current generation to match exactly.
    pub if_generation_match: Option<i64>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub storage_class: Option<StorageClass>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns blob facts, or `None` if the blob does not exist.
    async fn head(&self, uri: &str) -> Result<Option<BlobMeta>, StoreError>;

    async fn get(&self, uri: &str) -> Result<Bytes, StoreError>;

    /// Streams a blob to a local file, returning its facts.
    async fn get_to_file(&self, uri: &str, path: &Path) -> Result<BlobMeta, StoreError>;

    async fn put(&self, uri: &str, content: Bytes, opts: PutOptions)
        -> Result<BlobMeta, StoreError>;

    async fn put_file(
        &self,
        uri: &str,
        path: &Path,
        opts: PutOptions,
    ) -> Result<BlobMeta, StoreError>;

    async fn delete(&self, uri: &str) -> Result<(), StoreError>;

    /// Lists blob URIs under a prefix, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
