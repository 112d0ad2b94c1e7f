//! In-memory [`ObjectStore`] with real generation semantics. Used by the
//! workspace test suites; also handy for embedders exercising the engine
//! without a cloud backend.

use super::{BlobMeta, ObjectStore, PutOptions, StorageClass, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    meta: BlobMeta,
    content_type: Option<String>,
    content_encoding: Option<String>,
}

#[derive(Debug)]
pub struct MemStore {
    blobs: Mutex<BTreeMap<String, StoredBlob>>,
    next_generation: AtomicI64,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            // Generation 0 is reserved to mean "absent".
            next_generation: AtomicI64::new(1),
        }
    }

    /// Declared content type of a stored blob, for assertions in tests.
    pub fn content_type(&self, uri: &str) -> Option<String> {
        let blobs = self.blobs.lock().unwrap();
        blobs.get(uri).and_then(|b| b.content_type.clone())
    }

    /// Declared content encoding of a stored blob, for assertions in tests.
    pub fn content_encoding(&self, uri: &str) -> Option<String> {
        let blobs = self.blobs.lock().unwrap();
        blobs.get(uri).and_then(|b| b.content_encoding.clone())
    }

    fn store(&self, uri: &str, data: Bytes, opts: PutOptions) -> Result<BlobMeta, StoreError> {
        let mut blobs = self.blobs.lock().unwrap();
        if let Some(required) = opts.if_generation_match {
            let current = blobs.get(uri).map(|b| b.meta.generation).unwrap_or(0);
            if current != required {
                return Err(StoreError::PreconditionFailed(uri.to_string()));
            }
        }
        let meta = BlobMeta {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            size: data.len() as u64,
            crc32c: Some(base64::encode(
                crc32c::crc32c(&data).to_be_bytes(),
            )),
            storage_class: opts.storage_class.unwrap_or(StorageClass::Standard),
        };
        blobs.insert(
            uri.to_string(),
            StoredBlob {
                data,
                meta: meta.clone(),
                content_type: opts.content_type,
                content_encoding: opts.content_encoding,
            },
        );
        Ok(meta)
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn head(&self, uri: &str) -> Result<Option<BlobMeta>, StoreError> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(uri).map(|b| b.meta.clone()))
    }

    async fn get(&self, uri: &str) -> Result<Bytes, StoreError> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(uri)
            .map(|b| b.data.clone())
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))
    }

    async fn get_to_file(&self, uri: &str, path: &Path) -> Result<BlobMeta, StoreError> {
        let (data, meta) = {
            let blobs = self.blobs.lock().unwrap();
            let blob = blobs
                .get(uri)
                .ok_or_else(|| StoreError::NotFound(uri.to_string()))?;
            (blob.data.clone(), blob.meta.clone())
        };
        tokio::fs::write(path, &data).await?;
        Ok(meta)
    }

    async fn put(
        &self,
        uri: &str,
        content: Bytes,
        opts: PutOptions,
    ) -> Result<BlobMeta, StoreError> {
        self.store(uri, content, opts)
    }

    async fn put_file(
        &self,
        uri: &str,
        path: &Path,
        opts: PutOptions,
    ) -> Result<BlobMeta, StoreError> {
        let data = tokio::fs::read(path).await?;
        self.store(uri, Bytes::from(data), opts)
    }

    async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
