//! A distributed mutex built on a generation-numbered lock blob and the
//! store's atomic create-if-absent primitive. One writer at a time per
//! series; a holder can never be silently displaced, because the remembered
//! generation is compared on every subsequent operation.

use crate::error::Error;
use crate::store::{BlobMeta, ObjectStore, PutOptions, StoreError};
use crate::{uri, Result};
use bytes::Bytes;

/// Fixed per deployment; changing it would orphan every live lock.
pub const LOCK_FILE_NAME: &str = ".cod.lock";

#[derive(Debug, Clone)]
pub struct Locker {
    lock_uri: String,
    /// Generation of the lock blob we hold, once acquired.
    pub generation: Option<i64>,
}

impl Locker {
    pub fn new(series_uri: &str) -> Self {
        Locker {
            lock_uri: uri::join(series_uri, &[LOCK_FILE_NAME]),
            generation: None,
        }
    }

    /// Restores a locker from a serialized series object; `acquire` will
    /// re-adopt the lock if the generation still matches.
    pub fn with_generation(series_uri: &str, generation: Option<i64>) -> Self {
        Locker {
            lock_uri: uri::join(series_uri, &[LOCK_FILE_NAME]),
            generation,
        }
    }

    pub fn lock_uri(&self) -> &str {
        &self.lock_uri
    }

    /// First half of acquisition: if the lock blob exists and its generation
    /// matches the remembered one, re-adopt it and return `true`. An
    /// existing blob with any other generation belongs to someone else.
    /// Absent blob returns `false`; follow up with [`Locker::create`].
    pub async fn try_readopt(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        let Some(meta) = store.head(&self.lock_uri).await? else {
            return Ok(false);
        };
        if Some(meta.generation) != self.generation {
            return Err(Error::LockAcquisitionFailed(format!(
                "lock already exists with generation {} at {}",
                meta.generation, self.lock_uri
            )));
        }
        tracing::info!(uri = %self.lock_uri, generation = meta.generation, "re-adopted series lock");
        Ok(true)
    }

    /// Second half of acquisition: upload the lock blob with a
    /// create-if-absent precondition. The payload is the current metadata
    /// snapshot, so a stalled writer leaves a consistent recovery artifact.
    pub async fn create(&mut self, store: &dyn ObjectStore, payload: Bytes) -> Result<()> {
        let opts = PutOptions {
            if_generation_match: Some(0),
            content_type: Some("application/json".to_string()),
            content_encoding: Some("gzip".to_string()),
            ..Default::default()
        };
        let meta = match store.put(&self.lock_uri, payload, opts).await {
            Ok(meta) => meta,
            Err(StoreError::PreconditionFailed(_)) => {
                return Err(Error::LockAcquisitionFailed(format!(
                    "lock stolen during metadata fetch: {}",
                    self.lock_uri
                )));
            }
            Err(err) => return Err(err.into()),
        };
        self.generation = Some(meta.generation);
        tracing::info!(uri = %self.lock_uri, generation = meta.generation, "acquired series lock");
        Ok(())
    }

    /// Confirms the lock blob still exists with the remembered generation.
    pub async fn verify(&self, store: &dyn ObjectStore) -> Result<BlobMeta> {
        let Some(meta) = store.head(&self.lock_uri).await? else {
            let msg = format!("lock missing on verify: {}", self.lock_uri);
            tracing::error!(uri = %self.lock_uri, "lock missing on verify");
            return Err(Error::LockVerificationFailed(msg));
        };
        if Some(meta.generation) != self.generation {
            let msg = format!(
                "lock generation mismatch on verify: found {} != expected {:?}",
                meta.generation, self.generation
            );
            tracing::error!(uri = %self.lock_uri, found = meta.generation, "lock generation mismatch on verify");
            return Err(Error::LockVerificationFailed(msg));
        }
        Ok(meta)
    }

    /// Verifies, then deletes the lock blob. A failed verify propagates and
    /// leaves the blob untouched.
    pub async fn release(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.verify(store).await?;
        store.delete(&self.lock_uri).await?;
        self.generation = None;
        tracing::info!(uri = %self.lock_uri, "released series lock");
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.generation.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::mem::MemStore;

    const SERIES_URI: &str = "gs://bucket/dicomweb/studies/1.2.3.4.5.6.7.8.9.10/series/1.2.3.4.5.6.7.8.9.11";

    fn payload() -> Bytes {
        Bytes::from_static(b"{}")
    }

    #[tokio::test]
    async fn acquire_then_release() {
        let store = MemStore::new();
        let mut locker = Locker::new(SERIES_URI);
        assert!(!locker.try_readopt(&store).await.unwrap());
        locker.create(&store, payload()).await.unwrap();
        assert!(locker.is_held());
        locker.verify(&store).await.unwrap();
        locker.release(&store).await.unwrap();
        assert!(!locker.is_held());
        assert!(store.head(locker.lock_uri()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_acquirer_fails_fast() {
        let store = MemStore::new();
        let mut first = Locker::new(SERIES_URI);
        first.create(&store, payload()).await.unwrap();

        let mut second = Locker::new(SERIES_URI);
        let err = second.try_readopt(&store).await.unwrap_err();
        assert!(matches!(err, Error::LockAcquisitionFailed(_)));
    }

    #[tokio::test]
    async fn racing_create_loses_the_precondition() {
        let store = MemStore::new();
        let mut first = Locker::new(SERIES_URI);
        let mut second = Locker::new(SERIES_URI);
        // Both observed an absent lock; only one create can win.
        assert!(!first.try_readopt(&store).await.unwrap());
        assert!(!second.try_readopt(&store).await.unwrap());
        first.create(&store, payload()).await.unwrap();
        let err = second.create(&store, payload()).await.unwrap_err();
        assert!(matches!(err, Error::LockAcquisitionFailed(_)));
    }

    #[tokio::test]
    async fn readopt_by_generation() {
        let store = MemStore::new();
        let mut original = Locker::new(SERIES_URI);
        original.create(&store, payload()).await.unwrap();

        let mut successor = Locker::with_generation(SERIES_URI, original.generation);
        assert!(successor.try_readopt(&store).await.unwrap());
        successor.verify(&store).await.unwrap();
    }

    #[tokio::test]
    async fn verify_detects_theft() {
        let store = MemStore::new();
        let mut locker = Locker::new(SERIES_URI);
        locker.create(&store, payload()).await.unwrap();

        // Someone replaces the lock blob out from under us.
        store.delete(locker.lock_uri()).await.unwrap();
        let err = locker.verify(&store).await.unwrap_err();
        assert!(matches!(err, Error::LockVerificationFailed(_)));

        store
            .put(locker.lock_uri(), payload(), crate::store::PutOptions::default())
            .await
            .unwrap();
        let err = locker.verify(&store).await.unwrap_err();
        assert!(matches!(err, Error::LockVerificationFailed(_)));

        // Release refuses after a failed verify; the blob stays.
        assert!(locker.release(&store).await.is_err());
        assert!(store.head(locker.lock_uri()).await.unwrap().is_some());
    }
}
