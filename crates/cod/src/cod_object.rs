//! The engine's unit of work: a logical handle over one series at rest in
//! the object store. Owns the temp workspace and the lock, caches the
//! series metadata, and flushes dirty state with the sync protocol
//! (index before tar, tar before metadata).
//!
//! The UIDs given at construction are used directly in datastore URIs; if
//! they are supposed to be de-identified, that is the caller's job.

use crate::appender::{AppendOptions, AppendResult, CODAppender};
use crate::archive::{self, EMPTY_TAR_SIZE};
use crate::counters;
use crate::error::Error;
use crate::index;
use crate::instance::{self, Instance};
use crate::locker::Locker;
use crate::metadata::SeriesMetadata;
use crate::store::{PutOptions, StorageClass, StoreError};
use crate::{uri, Client, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};

const MIN_UID_LEN: usize = 10;

#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Acquire the series lock on construction. Without it, nothing done
    /// through this object can be persisted.
    pub lock: bool,
    /// With `false`, a series with no metadata blob is an error instead of
    /// an empty series.
    pub create_if_missing: bool,
    /// Delete a pre-existing `error.log` instead of refusing to initialize.
    pub override_errors: bool,
    /// The series' UIDs (and instance keys) are de-identified.
    pub hashed_uids: bool,
    /// Remembered lock generation, set when reconstituting a serialized
    /// series object; `acquire` re-adopts the lock if it still matches.
    pub lock_generation: Option<i64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            lock: false,
            create_if_missing: true,
            override_errors: false,
            hashed_uids: false,
            lock_generation: None,
        }
    }
}

pub struct CODObject {
    client: Client,
    datastore_path: String,
    study_uid: String,
    series_uid: String,
    hashed_uids: bool,
    locker: Option<Locker>,
    temp: Option<tempfile::TempDir>,
    metadata: Option<SeriesMetadata>,
    tar_synced: bool,
    metadata_synced: bool,
}

impl std::fmt::Display for CODObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CODObject({})", self.series_uri())
    }
}

impl std::fmt::Debug for CODObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CODObject")
            .field("series_uri", &self.series_uri())
            .field("locked", &self.is_locked())
            .field("tar_synced", &self.tar_synced)
            .field("metadata_synced", &self.metadata_synced)
            .finish()
    }
}

impl CODObject {
    /// Opens a series handle. With `lock = true` the series lock is
    /// acquired before anything else can happen to the series; otherwise
    /// metadata is loaded immediately and the object is read-only in
    /// effect. A series quarantined by a prior failure (an `error.log`
    /// blob) refuses to initialize unless `override_errors` is set.
    pub async fn open(
        client: Client,
        datastore_path: impl Into<String>,
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        opts: OpenOptions,
    ) -> Result<CODObject> {
        let mut cod = CODObject {
            client,
            datastore_path: datastore_path.into(),
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
            hashed_uids: opts.hashed_uids,
            locker: None,
            temp: None,
            metadata: None,
            tar_synced: false,
            metadata_synced: true,
        };
        cod.validate_uids()?;

        let error_log_uri = cod.error_log_uri();
        if cod.client.store.head(&error_log_uri).await?.is_some() {
            if opts.override_errors {
                cod.client.store.delete(&error_log_uri).await?;
                tracing::warn!(uri = %error_log_uri, "deleted existing error log");
            } else {
                return Err(Error::ErrorLogExists(error_log_uri));
            }
        }

        if opts.lock {
            let mut locker = Locker::with_generation(&cod.series_uri(), opts.lock_generation);
            if !locker.try_readopt(cod.client.store.as_ref()).await? {
                // Fetch-then-create: the generation-0 precondition on the
                // upload closes the race with a competing writer.
                cod.load_metadata(opts.create_if_missing).await?;
                let payload = cod.metadata_loaded()?.to_gzipped_json()?;
                locker
                    .create(cod.client.store.as_ref(), Bytes::from(payload))
                    .await?;
            }
            cod.locker = Some(locker);
        } else {
            cod.load_metadata(opts.create_if_missing).await?;
        }
        Ok(cod)
    }

    fn validate_uids(&self) -> Result<()> {
        for uid in [&self.study_uid, &self.series_uid] {
            if uid.len() < MIN_UID_LEN {
                return Err(Error::InvalidUid {
                    uid: uid.clone(),
                    reason: "must be at least 10 characters",
                });
            }
        }
        Ok(())
    }

    /// Clean operations require the lock; dirty operations are allowed
    /// unlocked but warn when run against a locked object.
    fn guard(&self, op: &'static str, dirty: bool) -> Result<()> {
        if !dirty && !self.is_locked() {
            return Err(Error::CleanOpWithoutLock(op));
        }
        if dirty && self.is_locked() {
            tracing::warn!(op, series = %self, "dirty operation against a locked series object");
        }
        Ok(())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn study_uid(&self) -> &str {
        &self.study_uid
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    pub fn hashed_uids(&self) -> bool {
        self.hashed_uids
    }

    pub fn is_locked(&self) -> bool {
        self.locker.is_some()
    }

    pub fn lock_generation(&self) -> Option<i64> {
        self.locker.as_ref().and_then(|l| l.generation)
    }

    pub fn tar_synced(&self) -> bool {
        self.tar_synced
    }

    pub fn metadata_synced(&self) -> bool {
        self.metadata_synced
    }

    pub fn series_uri(&self) -> String {
        uri::join(
            &self.datastore_path,
            &["studies", &self.study_uid, "series", &self.series_uid],
        )
    }

    pub fn tar_uri(&self) -> String {
        format!("{}.tar", self.series_uri())
    }

    pub fn metadata_uri(&self) -> String {
        uri::join(&self.series_uri(), &["metadata.json"])
    }

    pub fn index_uri(&self) -> String {
        uri::join(&self.series_uri(), &["index.sqlite"])
    }

    pub fn error_log_uri(&self) -> String {
        uri::join(&self.series_uri(), &["error.log"])
    }

    fn temp_dir(&mut self) -> Result<&Path> {
        if self.temp.is_none() {
            let temp = tempfile::Builder::new()
                .suffix(&format!("_{}", self.series_uid))
                .tempdir()?;
            self.temp = Some(temp);
        }
        match &self.temp {
            Some(temp) => Ok(temp.path()),
            None => unreachable!("temp dir just created"),
        }
    }

    /// Path of the local series tar, created empty if absent so it can
    /// always be opened in append mode.
    pub(crate) async fn tar_file_path(&mut self) -> Result<PathBuf> {
        let filename = format!("{}.tar", self.series_uid);
        let path = self.temp_dir()?.join(filename);
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, archive::empty_archive()).await?;
        }
        Ok(path)
    }

    pub(crate) fn index_file_path(&mut self) -> Result<PathBuf> {
        Ok(self.temp_dir()?.join("index.sqlite"))
    }

    async fn load_metadata(&mut self, create_if_missing: bool) -> Result<()> {
        if self.metadata.is_some() {
            return Ok(());
        }
        let metadata_uri = self.metadata_uri();
        match self.client.store.get(&metadata_uri).await {
            Ok(bytes) => {
                let metadata = SeriesMetadata::from_bytes(&bytes)?;
                self.hashed_uids = self.hashed_uids || metadata.is_hashed;
                self.metadata = Some(metadata);
            }
            Err(StoreError::NotFound(_)) if create_if_missing => {
                self.metadata = Some(SeriesMetadata::new(
                    &self.study_uid,
                    &self.series_uid,
                    self.hashed_uids,
                ));
            }
            Err(StoreError::NotFound(_)) => {
                return Err(Error::SeriesNotFound(metadata_uri));
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    pub(crate) fn metadata_loaded(&self) -> Result<&SeriesMetadata> {
        self.metadata
            .as_ref()
            .ok_or_else(|| Error::Metadata("series metadata has not been loaded".to_string()))
    }

    pub(crate) fn metadata_loaded_mut(&mut self) -> Result<&mut SeriesMetadata> {
        self.metadata
            .as_mut()
            .ok_or_else(|| Error::Metadata("series metadata has not been loaded".to_string()))
    }

    pub(crate) fn metadata_instance_mut(&mut self, key: &str) -> Result<&mut Instance> {
        self.metadata
            .as_mut()
            .and_then(|m| m.instances.get_mut(key))
            .ok_or_else(|| Error::Metadata(format!("no instance {key} in series metadata")))
    }

    pub(crate) fn metadata_total_size(&self) -> u64 {
        self.metadata.as_ref().map(|m| m.total_size()).unwrap_or(0)
    }

    pub(crate) fn mark_tar_dirty(&mut self) {
        self.tar_synced = false;
    }

    pub(crate) fn mark_metadata_dirty(&mut self) {
        self.metadata_synced = false;
    }

    /// The series metadata, fetched once and cached.
    pub async fn get_metadata(
        &mut self,
        create_if_missing: bool,
        dirty: bool,
    ) -> Result<&SeriesMetadata> {
        self.guard("get_metadata", dirty)?;
        self.load_metadata(create_if_missing).await?;
        self.metadata_loaded()
    }

    /// Appends a batch of instances; see [`AppendResult`] for the outcome
    /// partition.
    pub async fn append(
        &mut self,
        instances: Vec<Instance>,
        opts: &AppendOptions,
        dirty: bool,
    ) -> Result<AppendResult> {
        self.guard("append", dirty)?;
        self.load_metadata(true).await?;
        CODAppender::new(self).append(instances, opts).await
    }

    /// Flushes dirty state to the store. Upload order is fixed: index, then
    /// tar, then metadata. A reader that observes a metadata entry is
    /// guaranteed the tar bytes it references are already fetchable.
    pub async fn sync(&mut self, tar_storage_class: StorageClass) -> Result<()> {
        self.guard("sync", false)?;
        if self.tar_synced && self.metadata_synced {
            tracing::warn!(series = %self, "nothing to sync");
            return Ok(());
        }
        // Worth the round trip: never upload over a lock we no longer hold.
        let locker = self
            .locker
            .as_ref()
            .ok_or(Error::CleanOpWithoutLock("sync"))?;
        locker.verify(self.client.store.as_ref()).await?;

        if !self.tar_synced {
            let tar_path = self.tar_file_path().await?;
            if tokio::fs::metadata(&tar_path).await?.len() == EMPTY_TAR_SIZE {
                tracing::warn!(series = %self, "skipping tar sync; tar is empty");
            } else {
                let index_path = self.index_file_path()?;
                if tokio::fs::metadata(&index_path).await.is_err() {
                    return Err(Error::IndexMissing(index_path.display().to_string()));
                }
                self.client
                    .store
                    .put_file(&self.index_uri(), &index_path, PutOptions::default())
                    .await?;
                counters::storage_create(StorageClass::Standard);
                self.client
                    .store
                    .put_file(
                        &self.tar_uri(),
                        &tar_path,
                        PutOptions {
                            storage_class: Some(tar_storage_class),
                            ..Default::default()
                        },
                    )
                    .await?;
                counters::storage_create(tar_storage_class);
                self.tar_synced = true;
            }
        }

        if !self.metadata_synced {
            let payload = self.metadata_loaded()?.to_gzipped_json()?;
            self.client
                .store
                .put(
                    &self.metadata_uri(),
                    Bytes::from(payload),
                    PutOptions {
                        content_type: Some("application/json".to_string()),
                        content_encoding: Some("gzip".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            counters::storage_create(StorageClass::Standard);
            self.metadata_synced = true;
        }

        tracing::info!(series = %self, "synced series");
        Ok(())
    }

    /// Quarantines the series: places a small text blob whose presence
    /// makes any later initialization fail until explicitly overridden.
    /// Always a clean operation; quarantine is only written under the lock.
    pub async fn upload_error_log(&mut self, message: &str) -> Result<()> {
        self.guard("upload_error_log", false)?;
        let error_log_uri = self.error_log_uri();
        // Quarantined series fail initialization, so an existing error log
        // here means something is badly off.
        if self.client.store.head(&error_log_uri).await?.is_some() {
            tracing::error!(uri = %error_log_uri, "error log already exists");
            return Err(Error::ErrorLogExists(error_log_uri));
        }
        tracing::warn!(uri = %error_log_uri, message, "uploading error log");
        self.client
            .store
            .put(
                &error_log_uri,
                Bytes::from(message.to_string()),
                PutOptions {
                    content_type: Some("text/plain".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Downloads the tar (and index) into the local workspace.
    pub async fn pull_tar(&mut self, dirty: bool) -> Result<()> {
        self.guard("pull_tar", dirty)?;
        self.force_fetch_tar(true).await
    }

    /// Fetches regardless of sync flags. Ingestion skips the index since it
    /// is about to be rebuilt.
    pub(crate) async fn force_fetch_tar(&mut self, fetch_index: bool) -> Result<()> {
        let tar_path = self.tar_file_path().await?;
        let meta = self
            .client
            .store
            .get_to_file(&self.tar_uri(), &tar_path)
            .await?;
        counters::storage_get(meta.storage_class);
        if fetch_index {
            let index_path = self.index_file_path()?;
            let meta = self
                .client
                .store
                .get_to_file(&self.index_uri(), &index_path)
                .await?;
            counters::storage_get(meta.storage_class);
        }
        // The local tar now mirrors the datastore by definition.
        self.tar_synced = true;
        Ok(())
    }

    /// Random access to one packed instance's bytes, located through the
    /// sqlite index.
    pub async fn read_instance(
        &mut self,
        instance_uid: &str,
        dirty: bool,
    ) -> Result<index::TarSlice> {
        self.guard("read_instance", dirty)?;
        self.load_metadata(false).await?;
        if !self
            .metadata_loaded()?
            .instances
            .contains_key(instance_uid)
        {
            return Err(Error::TarMissingInstance(instance_uid.to_string()));
        }
        let tar_path = self.tar_file_path().await?;
        let index_path = self.index_file_path()?;
        if tokio::fs::metadata(&tar_path).await?.len() == EMPTY_TAR_SIZE
            || tokio::fs::metadata(&index_path).await.is_err()
        {
            self.force_fetch_tar(true).await?;
        }
        // The sqlite lookup and the tar open are blocking file work.
        let uid = instance_uid.to_string();
        tokio::task::spawn_blocking(move || -> Result<index::TarSlice> {
            let member = format!("instances/{uid}.dcm");
            let (offset, size) = index::lookup(&index_path, &member)?
                .ok_or_else(|| Error::TarMissingInstance(uid))?;
            Ok(index::TarSlice::open(&tar_path, offset, offset + size)?)
        })
        .await?
    }

    /// Verifies that every instance the metadata references exists in the
    /// tar at its advertised byte range with matching content hash.
    pub async fn validate_integrity(&mut self, dirty: bool) -> Result<()> {
        self.guard("validate_integrity", dirty)?;
        self.load_metadata(false).await?;
        let tar_path = self.tar_file_path().await?;
        if tokio::fs::metadata(&tar_path).await?.len() == EMPTY_TAR_SIZE
            && !self.metadata_loaded()?.instances.is_empty()
        {
            self.force_fetch_tar(true).await?;
        }

        let entries: Vec<(String, Option<(u64, u64)>, Option<String>)> = self
            .metadata_loaded()?
            .instances
            .iter()
            .map(|(uid, i)| (uid.clone(), i.byte_offsets(), i.crc32c_cached()))
            .collect();
        // Re-hashing every member is blocking work.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let tar_len = std::fs::metadata(&tar_path)?.len();
            for (uid, offsets, expected) in entries {
                let (start, stop) =
                    offsets.ok_or_else(|| Error::TarMissingInstance(uid.clone()))?;
                if stop > tar_len || start >= stop {
                    return Err(Error::TarMissingInstance(uid));
                }
                let expected = expected
                    .ok_or_else(|| Error::Metadata(format!("instance {uid} has no crc32c")))?;
                let mut slice = index::TarSlice::open(&tar_path, start, stop)?;
                let computed = instance::reader_crc32c(&mut slice)?;
                if computed != expected {
                    return Err(Error::HashMismatch {
                        uri: uid,
                        computed,
                        expected,
                    });
                }
            }
            Ok(())
        })
        .await?
    }

    /// Releases the lock and tears down the workspace. Dropping the object
    /// without closing (the unwind path) leaves the lock hanging for an
    /// operator to inspect, and logs that it did.
    pub async fn close(mut self) -> Result<()> {
        if let Some(locker) = &mut self.locker {
            if locker.is_held() {
                locker.release(self.client.store.as_ref()).await?;
            }
        }
        Ok(())
    }

    /// Snapshots this object for handoff to another process. The temp
    /// workspace does not travel; the successor re-pulls what it needs.
    pub fn serialize(&self) -> Result<CODSnapshot> {
        Ok(CODSnapshot {
            datastore_path: self.datastore_path.clone(),
            study_uid: self.study_uid.clone(),
            series_uid: self.series_uid.clone(),
            hashed_uids: self.hashed_uids,
            lock_generation: self.lock_generation(),
            metadata: self
                .metadata
                .as_ref()
                .map(|m| m.to_value())
                .transpose()?,
            tar_synced: self.tar_synced,
            metadata_synced: self.metadata_synced,
        })
    }

    /// Reconstitutes a snapshot against a fresh client. A snapshot taken
    /// with the lock held re-adopts it by generation.
    pub async fn deserialize(snapshot: CODSnapshot, client: Client) -> Result<CODObject> {
        let lock = snapshot.lock_generation.is_some();
        let mut cod = CODObject::open(
            client,
            snapshot.datastore_path,
            snapshot.study_uid,
            snapshot.series_uid,
            OpenOptions {
                lock,
                lock_generation: snapshot.lock_generation,
                hashed_uids: snapshot.hashed_uids,
                ..Default::default()
            },
        )
        .await?;
        if let Some(value) = snapshot.metadata {
            cod.metadata = Some(SeriesMetadata::from_value(value)?);
        }
        cod.tar_synced = snapshot.tar_synced;
        cod.metadata_synced = snapshot.metadata_synced;
        Ok(cod)
    }
}

impl Drop for CODObject {
    fn drop(&mut self) {
        if let Some(locker) = &self.locker {
            if locker.is_held() {
                tracing::warn!(
                    series = %self,
                    generation = ?locker.generation,
                    "lock left hanging on drop; operator attention required"
                );
            }
        }
        // The temp workspace is destroyed unconditionally by TempDir.
    }
}

/// Portable snapshot of a [`CODObject`]; see [`CODObject::serialize`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CODSnapshot {
    pub datastore_path: String,
    pub study_uid: String,
    pub series_uid: String,
    pub hashed_uids: bool,
    pub lock_generation: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub tar_synced: bool,
    pub metadata_synced: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::locker::LOCK_FILE_NAME;
    use crate::store::mem::MemStore;
    use crate::store::ObjectStore;
    use crate::testing::{dicom_bytes, StubDicom, StubDicomFile};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::Arc;

    const DATASTORE: &str = "gs://imaging-pacs/v1/dicomweb";
    const STUDY: &str = "1.2.3.4.5.6.7.8.9.10";
    const SERIES: &str = "1.2.3.4.5.6.7.8.9.11";
    const SOP: &str = "1.2.3.4.5.6.7.8.9.12";

    fn client_with_store() -> (Arc<MemStore>, Client) {
        crate::testing::init_tracing();
        let store = Arc::new(MemStore::new());
        let client = Client::new(store.clone(), Arc::new(StubDicom));
        (store, client)
    }

    fn local_instance(dir: &Path, name: &str, file: &StubDicomFile) -> Instance {
        let path = dir.join(name);
        std::fs::write(&path, dicom_bytes(file)).unwrap();
        Instance::new(path.to_string_lossy().into_owned())
    }

    async fn open_locked(client: &Client) -> CODObject {
        CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions {
                lock: true,
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn append_and_sync_single_instance() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let instance = local_instance(dir.path(), "a.dcm", &StubDicomFile::new(STUDY, SERIES, SOP));

        let mut cod = open_locked(&client).await;
        let result = cod
            .append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        assert_eq!(result.new.len(), 1);
        assert!(result.same.is_empty());
        assert!(result.conflict.is_empty());
        assert!(result.errors.is_empty());
        assert_eq!(
            result.new[0].uri(),
            format!("{}://instances/{SOP}.dcm", cod.tar_uri())
        );
        assert!(!cod.tar_synced());
        assert!(!cod.metadata_synced());

        // Nothing reaches the store before sync.
        assert!(store.head(&cod.tar_uri()).await.unwrap().is_none());
        assert!(store.head(&cod.index_uri()).await.unwrap().is_none());
        assert!(store.head(&cod.metadata_uri()).await.unwrap().is_none());

        cod.sync(StorageClass::Standard).await.unwrap();
        assert!(cod.tar_synced());
        assert!(cod.metadata_synced());

        let tar_meta = store.head(&cod.tar_uri()).await.unwrap().unwrap();
        assert!(tar_meta.size > 0);
        assert_ne!(tar_meta.size, EMPTY_TAR_SIZE);
        assert!(store.head(&cod.index_uri()).await.unwrap().is_some());
        assert_eq!(
            store.content_encoding(&cod.metadata_uri()).as_deref(),
            Some("gzip")
        );

        let lock_uri = uri::join(&cod.series_uri(), &[LOCK_FILE_NAME]);
        assert!(store.head(&lock_uri).await.unwrap().is_some());
        cod.close().await.unwrap();
        assert!(store.head(&lock_uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let file = StubDicomFile::new(STUDY, SERIES, SOP);

        let mut cod = open_locked(&client).await;
        let tar_uri = cod.tar_uri();
        let metadata_uri = cod.metadata_uri();
        let instance = local_instance(dir.path(), "a.dcm", &file);
        cod.append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();

        let tar_gen = store.head(&tar_uri).await.unwrap().unwrap().generation;
        let metadata_gen = store.head(&metadata_uri).await.unwrap().unwrap().generation;

        // The identical batch a second time is pure SAME: no uploads move.
        let mut cod = open_locked(&client).await;
        let instance = local_instance(dir.path(), "b.dcm", &file);
        let result = cod
            .append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        assert!(result.new.is_empty());
        assert_eq!(result.same.len(), 1);
        assert!(result.conflict.is_empty());
        assert!(result.errors.is_empty());
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();

        assert_eq!(
            store.head(&tar_uri).await.unwrap().unwrap().generation,
            tar_gen
        );
        assert_eq!(
            store.head(&metadata_uri).await.unwrap().unwrap().generation,
            metadata_gen
        );
    }

    #[tokio::test]
    async fn conflicting_content_is_recorded_not_packed() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();

        let mut cod = open_locked(&client).await;
        let tar_uri = cod.tar_uri();
        let metadata_uri = cod.metadata_uri();
        let instance =
            local_instance(dir.path(), "a.dcm", &StubDicomFile::new(STUDY, SERIES, SOP));
        cod.append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();
        let tar_gen = store.head(&tar_uri).await.unwrap().unwrap().generation;

        // Same identity, one header changed: a diff-hash dupe.
        let v2 = StubDicomFile::new(STUDY, SERIES, SOP).with_tag(
            "00080008",
            "CS",
            serde_json::json!("DERIVED"),
        );
        let v2_uri = "gs://imaging-ingest/incoming/v2.dcm";
        store
            .put(v2_uri, dicom_bytes(&v2).into(), Default::default())
            .await
            .unwrap();

        let mut cod = open_locked(&client).await;
        let result = cod
            .append(
                vec![Instance::new(v2_uri)],
                &AppendOptions::default(),
                false,
            )
            .await
            .unwrap();
        assert!(result.new.is_empty());
        assert!(result.same.is_empty());
        assert_eq!(result.conflict.len(), 1);
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();

        // The tar never moved; only metadata gained the dupe URI.
        assert_eq!(
            store.head(&tar_uri).await.unwrap().unwrap().generation,
            tar_gen
        );
        assert!(
            store.head(&metadata_uri).await.unwrap().unwrap().generation > tar_gen
        );

        let mut reader = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions::default(),
        )
        .await
        .unwrap();
        let metadata = reader.get_metadata(false, true).await.unwrap();
        assert_eq!(
            metadata.instances[SOP].diff_hash_dupe_paths(),
            [v2_uri.to_string()]
        );
    }

    #[tokio::test]
    async fn overlarge_instance_is_dropped() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let instance = local_instance(dir.path(), "a.dcm", &StubDicomFile::new(STUDY, SERIES, SOP));

        let mut cod = open_locked(&client).await;
        let result = cod
            .append(
                vec![instance],
                &AppendOptions {
                    max_instance_size_gb: 0.0000001,
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        assert!(result.new.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            result.errors[0].1,
            Error::OverlargeInstance { .. }
        ));

        cod.sync(StorageClass::Standard).await.unwrap();
        assert!(store.head(&cod.tar_uri()).await.unwrap().is_none());
        cod.close().await.unwrap();
    }

    #[tokio::test]
    async fn overlarge_series_aborts_the_append() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let instance = local_instance(dir.path(), "a.dcm", &StubDicomFile::new(STUDY, SERIES, SOP));

        let mut cod = open_locked(&client).await;
        let err = cod
            .append(
                vec![instance],
                &AppendOptions {
                    max_series_size_gb: 0.0000001,
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OverlargeSeries { .. }));

        // No partial writes of any kind.
        assert!(store.head(&cod.tar_uri()).await.unwrap().is_none());
        assert!(store.head(&cod.metadata_uri()).await.unwrap().is_none());
        cod.close().await.unwrap();
    }

    #[tokio::test]
    async fn lock_contention_fails_the_second_writer() {
        let (_store, client) = client_with_store();
        let first = open_locked(&client).await;

        let err = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions {
                lock: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LockAcquisitionFailed(_)));

        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn error_log_quarantines_the_series() {
        let (store, client) = client_with_store();
        let mut cod = open_locked(&client).await;
        let error_log_uri = cod.error_log_uri();
        cod.upload_error_log("tar and metadata disagree")
            .await
            .unwrap();
        // A second upload attempt is itself an error.
        let err = cod.upload_error_log("again").await.unwrap_err();
        assert!(matches!(err, Error::ErrorLogExists(_)));
        cod.close().await.unwrap();

        let err = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ErrorLogExists(_)));

        // Overriding deletes the quarantine marker and proceeds.
        let _cod = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions {
                override_errors: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(store.head(&error_log_uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn absent_series_errors_without_create() {
        let (_store, client) = client_with_store();
        let err = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions {
                create_if_missing: false,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SeriesNotFound(_)));
    }

    #[tokio::test]
    async fn clean_operations_require_the_lock() {
        let (_store, client) = client_with_store();
        let mut cod = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions::default(),
        )
        .await
        .unwrap();

        let err = cod
            .append(Vec::new(), &AppendOptions::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CleanOpWithoutLock("append")));
        let err = cod.sync(StorageClass::Standard).await.unwrap_err();
        assert!(matches!(err, Error::CleanOpWithoutLock("sync")));
    }

    #[tokio::test]
    async fn short_uids_are_rejected() {
        let (_store, client) = client_with_store();
        let err = CODObject::open(
            client.clone(),
            DATASTORE,
            "1.2.3.4.5",
            SERIES,
            OpenOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidUid { .. }));
    }

    #[tokio::test]
    async fn snapshot_hands_off_the_lock() {
        let (_store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let instance = local_instance(dir.path(), "a.dcm", &StubDicomFile::new(STUDY, SERIES, SOP));

        let mut cod = open_locked(&client).await;
        cod.append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        cod.sync(StorageClass::Standard).await.unwrap();
        let generation = cod.lock_generation();
        let snapshot = cod.serialize().unwrap();

        // The successor re-adopts the lock by generation and carries the
        // metadata without re-fetching.
        let successor = CODObject::deserialize(snapshot, client.clone()).await.unwrap();
        assert_eq!(successor.lock_generation(), generation);
        assert!(successor.metadata_loaded().unwrap().instances.contains_key(SOP));
        assert!(successor.tar_synced());
        assert!(successor.metadata_synced());
        successor.close().await.unwrap();

        // The original handle now points at a released lock; drop it
        // without releasing again.
        drop(cod);
    }

    #[tokio::test]
    async fn read_instance_round_trips_bytes() {
        let (_store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let bytes = dicom_bytes(&StubDicomFile::new(STUDY, SERIES, SOP));
        let path = dir.path().join("a.dcm");
        std::fs::write(&path, &bytes).unwrap();

        let mut cod = open_locked(&client).await;
        cod.append(
            vec![Instance::new(path.to_string_lossy().into_owned())],
            &AppendOptions::default(),
            false,
        )
        .await
        .unwrap();
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();

        // A fresh unlocked reader pulls tar and index on demand.
        let mut reader = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions::default(),
        )
        .await
        .unwrap();
        let mut slice = reader.read_instance(SOP, true).await.unwrap();
        let mut read_back = Vec::new();
        slice.read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, bytes);
    }

    #[tokio::test]
    async fn integrity_check_detects_corruption() {
        let (_store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let instance = local_instance(dir.path(), "a.dcm", &StubDicomFile::new(STUDY, SERIES, SOP));

        let mut cod = open_locked(&client).await;
        cod.append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        cod.validate_integrity(false).await.unwrap();

        // Flip bytes inside the packed member; the hash check must notice.
        let (start, _) = cod.metadata_loaded().unwrap().instances[SOP]
            .byte_offsets()
            .unwrap();
        let tar_path = cod.tar_file_path().await.unwrap();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&tar_path)
            .unwrap();
        file.seek(SeekFrom::Start(start + 140)).unwrap();
        file.write_all(b"XXXX").unwrap();
        drop(file);

        let err = cod.validate_integrity(false).await.unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        cod.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_append_extends_the_existing_tar() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        const SOP2: &str = "1.2.3.4.5.6.7.8.9.13";

        let mut cod = open_locked(&client).await;
        cod.append(
            vec![local_instance(
                dir.path(),
                "a.dcm",
                &StubDicomFile::new(STUDY, SERIES, SOP),
            )],
            &AppendOptions::default(),
            false,
        )
        .await
        .unwrap();
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();

        // A later session pulls the existing tar and appends to it.
        let mut cod = open_locked(&client).await;
        let result = cod
            .append(
                vec![local_instance(
                    dir.path(),
                    "b.dcm",
                    &StubDicomFile::new(STUDY, SERIES, SOP2),
                )],
                &AppendOptions::default(),
                false,
            )
            .await
            .unwrap();
        assert_eq!(result.new.len(), 1);
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.validate_integrity(false).await.unwrap();

        let metadata = cod.metadata_loaded().unwrap();
        assert_eq!(
            metadata.instances.keys().collect::<Vec<_>>(),
            [SOP, SOP2]
        );
        cod.close().await.unwrap();

        // Both members are reachable through the stored artifacts.
        let mut reader = CODObject::open(
            client.clone(),
            DATASTORE,
            STUDY,
            SERIES,
            OpenOptions::default(),
        )
        .await
        .unwrap();
        reader.read_instance(SOP, true).await.unwrap();
        reader.read_instance(SOP2, true).await.unwrap();
        let _ = store;
    }
}
