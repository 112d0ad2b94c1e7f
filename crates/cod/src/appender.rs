//! Appends a batch of instances to a series: gates sizes, dedupes the
//! input, checks ownership, three-way classifies against existing metadata
//! (NEW / SAME / DIFF), packs new instances into the tar, and updates the
//! metadata map. Instantiated by [`CODObject::append`] and used once.

use crate::archive;
use crate::cod_object::CODObject;
use crate::counters;
use crate::error::Error;
use crate::index;
use crate::instance::Instance;
use crate::uri;
use crate::{Client, Result};
use indexmap::IndexMap;

const BYTES_PER_GB: f64 = (1024u64 * 1024 * 1024) as f64;

#[derive(Debug, Clone)]
pub struct AppendOptions {
    /// Maximum size of a single instance, in gigabytes. Overlarge instances
    /// are dropped and recorded as errors.
    pub max_instance_size_gb: f64,
    /// Maximum total series size, in gigabytes. Exceeding it aborts the
    /// whole append.
    pub max_series_size_gb: f64,
    /// Delete local origin files of successfully packed instances. Remote
    /// origins are never deleted this way.
    pub delete_local_origin: bool,
}

impl Default for AppendOptions {
    fn default() -> Self {
        AppendOptions {
            max_instance_size_gb: 10.0,
            max_series_size_gb: 100.0,
            delete_local_origin: false,
        }
    }
}

/// Outcome of one append call. The four sets are disjoint and partition the
/// input batch.
#[derive(Debug, Default)]
pub struct AppendResult {
    /// Instances newly packed into the tar.
    pub new: Vec<Instance>,
    /// Perfect duplicates of already-stored instances.
    pub same: Vec<Instance>,
    /// Same identity as a stored instance, different content.
    pub conflict: Vec<Instance>,
    /// Instances dropped along the way, with the error that dropped them.
    pub errors: Vec<(Instance, Error)>,
}

#[derive(Debug, Default)]
struct StateChange {
    new: Vec<Instance>,
    /// Instance plus the metadata key of its stored counterpart.
    same: Vec<(Instance, String)>,
    diff: Vec<(Instance, String)>,
}

pub(crate) struct CODAppender<'a> {
    cod: &'a mut CODObject,
    client: Client,
    result: AppendResult,
}

impl<'a> CODAppender<'a> {
    pub(crate) fn new(cod: &'a mut CODObject) -> Self {
        let client = cod.client().clone();
        CODAppender {
            cod,
            client,
            result: AppendResult::default(),
        }
    }

    pub(crate) async fn append(
        mut self,
        instances: Vec<Instance>,
        opts: &AppendOptions,
    ) -> Result<AppendResult> {
        let instances = self.size_gate(instances, opts).await?;
        let instances = self.dedupe_input(instances).await;
        let instances = self.check_ownership(instances).await;
        let change = self.classify(instances).await?;

        self.handle_same(change.same)?;
        if change.new.is_empty() && change.diff.is_empty() {
            tracing::warn!(series = %self.cod, "no new instances");
            counters::duplicate_series();
            return Ok(self.result);
        }
        self.handle_diff(change.diff).await?;
        if change.new.is_empty() {
            return Ok(self.result);
        }
        self.handle_new(change.new, opts).await?;

        let tar_path = self.cod.tar_file_path().await?;
        let tar_size = tokio::fs::metadata(&tar_path).await?.len();
        counters::tar_success(tar_size);
        Ok(self.result)
    }

    /// Drops instances over the per-instance cap (recorded as errors) and
    /// aborts if accepted input plus the existing series would exceed the
    /// per-series cap.
    async fn size_gate(
        &mut self,
        instances: Vec<Instance>,
        opts: &AppendOptions,
    ) -> Result<Vec<Instance>> {
        let client = self.client.clone();
        let max_instance = (opts.max_instance_size_gb * BYTES_PER_GB) as u64;
        let max_series = (opts.max_series_size_gb * BYTES_PER_GB) as u64;

        let mut kept = Vec::new();
        let mut total: u64 = 0;
        for mut instance in instances {
            let size = match instance.size(&client, true).await {
                Ok(size) => size,
                Err(err) => {
                    tracing::error!(uri = %instance.uri(), %err, "failed to size instance");
                    self.result.errors.push((instance, err));
                    continue;
                }
            };
            if size > max_instance {
                let err = Error::OverlargeInstance {
                    uri: instance.uri().to_string(),
                    size,
                    limit_gb: opts.max_instance_size_gb,
                };
                tracing::warn!(%err, "dropping overlarge instance");
                self.result.errors.push((instance, err));
                continue;
            }
            total += size;
            kept.push(instance);
        }

        total += self.cod.metadata_total_size();
        if total > max_series {
            return Err(Error::OverlargeSeries {
                series: self.cod.series_uri(),
                size: total,
                limit_gb: opts.max_series_size_gb,
            });
        }
        Ok(kept)
    }

    /// Enforces instance-UID uniqueness within the batch itself. All
    /// duplicates are dropped; diff-hash dupe URIs are recorded on the kept
    /// instance when remote.
    async fn dedupe_input(&mut self, instances: Vec<Instance>) -> Vec<Instance> {
        let client = self.client.clone();
        let mut by_uid: IndexMap<String, Instance> = IndexMap::new();
        for mut instance in instances {
            let uid = match instance.instance_uid(&client, true).await {
                Ok(uid) => uid,
                Err(err) => {
                    tracing::error!(uri = %instance.uri(), %err, "failed to dedupe instance");
                    self.result.errors.push((instance, err));
                    continue;
                }
            };
            let kept = match by_uid.entry(uid) {
                indexmap::map::Entry::Vacant(slot) => {
                    slot.insert(instance);
                    continue;
                }
                indexmap::map::Entry::Occupied(slot) => slot.into_mut(),
            };
            let verdict = async {
                let new_crc = instance.crc32c(&client, true).await?;
                let kept_crc = kept.crc32c(&client, false).await?;
                Ok::<bool, Error>(new_crc == kept_crc)
            }
            .await;
            match verdict {
                Ok(true) => {
                    tracing::warn!(uri = %instance.uri(), "removing true duplicate from input");
                    self.result.same.push(instance);
                }
                Ok(false) => {
                    if let Err(err) = kept.append_diff_hash_dupe(&client, &mut instance).await {
                        self.result.errors.push((instance, err));
                        continue;
                    }
                    tracing::warn!(uri = %instance.uri(), "removing diff-hash dupe from input");
                    self.result.conflict.push(instance);
                }
                Err(err) => {
                    self.result.errors.push((instance, err));
                }
            }
        }
        by_uid.into_iter().map(|(_, instance)| instance).collect()
    }

    /// Every remaining instance must carry this series' identity.
    async fn check_ownership(&mut self, instances: Vec<Instance>) -> Vec<Instance> {
        let client = self.client.clone();
        let study_uid = self.cod.study_uid().to_string();
        let series_uid = self.cod.series_uid().to_string();
        let hashed = self.cod.hashed_uids();

        let mut kept = Vec::new();
        for mut instance in instances {
            match instance
                .belongs_to(&client, &study_uid, &series_uid, hashed)
                .await
            {
                Ok(true) => kept.push(instance),
                Ok(false) => {
                    let err = Error::NotInSeries {
                        instance: instance.uri().to_string(),
                        series: self.cod.series_uri(),
                    };
                    tracing::error!(%err, "dropping instance");
                    self.result.errors.push((instance, err));
                }
                Err(err) => {
                    tracing::error!(uri = %instance.uri(), %err, "ownership check failed");
                    self.result.errors.push((instance, err));
                }
            }
        }
        kept
    }

    /// Classifies each input against existing metadata: absent UID is NEW,
    /// same UID and hash is SAME, same UID with a different hash is DIFF.
    async fn classify(&mut self, instances: Vec<Instance>) -> Result<StateChange> {
        let client = self.client.clone();
        let hashed = self.cod.hashed_uids();
        let mut change = StateChange::default();

        let existing: IndexMap<String, String> = self
            .cod
            .metadata_loaded()?
            .instances
            .iter()
            .filter_map(|(uid, instance)| {
                instance.crc32c_cached().map(|crc| (uid.clone(), crc))
            })
            .collect();
        if existing.is_empty() {
            change.new = instances;
            return Ok(change);
        }

        for mut instance in instances {
            let keyed = async {
                let uid = if hashed {
                    instance.hashed_instance_uid(&client, true).await?
                } else {
                    instance.instance_uid(&client, true).await?
                };
                let crc = match existing.get(&uid) {
                    Some(existing_crc) => {
                        Some(instance.crc32c(&client, true).await? == *existing_crc)
                    }
                    None => None,
                };
                Ok::<_, Error>((uid, crc))
            }
            .await;
            match keyed {
                Ok((_, None)) => change.new.push(instance),
                Ok((uid, Some(true))) => {
                    counters::true_dupe();
                    change.same.push((instance, uid));
                }
                Ok((uid, Some(false))) => {
                    counters::diff_hash_dupe();
                    change.diff.push((instance, uid));
                }
                Err(err) => {
                    tracing::error!(uri = %instance.uri(), %err, "failed to classify instance");
                    self.result.errors.push((instance, err));
                }
            }
        }
        Ok(change)
    }

    /// SAME instances only get logged; neither the tar nor metadata moves.
    fn handle_same(&mut self, same: Vec<(Instance, String)>) -> Result<()> {
        for (instance, key) in same {
            let stored_uri = self
                .cod
                .metadata_loaded()?
                .instances
                .get(&key)
                .map(|i| i.uri().to_string())
                .unwrap_or_default();
            tracing::warn!(
                uri = %instance.uri(),
                duplicate_of = %stored_uri,
                "skipping duplicate instance (same hash)"
            );
            self.result.same.push(instance);
        }
        Ok(())
    }

    /// DIFF instances leave the tar alone; their URIs are recorded on the
    /// stored counterpart, and metadata is dirtied only if a list changed.
    async fn handle_diff(&mut self, diff: Vec<(Instance, String)>) -> Result<()> {
        let client = self.client.clone();
        let mut dirtied = false;
        for (mut instance, key) in diff {
            tracing::warn!(
                uri = %instance.uri(),
                "skipping duplicate instance (diff hash)"
            );
            let changed = self
                .cod
                .metadata_instance_mut(&key)?
                .append_diff_hash_dupe(&client, &mut instance)
                .await?;
            dirtied |= changed;
            self.result.conflict.push(instance);
        }
        if dirtied {
            self.cod.mark_metadata_dirty();
        }
        Ok(())
    }

    /// Packs NEW instances into the tar, rebuilds the index, extracts
    /// header metadata, and inserts the packed instances into the metadata
    /// map. Per-instance failures are recorded; zero successes aborts.
    async fn handle_new(&mut self, new: Vec<Instance>, opts: &AppendOptions) -> Result<()> {
        let client = self.client.clone();
        let hashed = self.cod.hashed_uids();

        // An existing tar must be pulled before appending to it. The index
        // is not fetched; it is rebuilt below anyway.
        if !self.cod.metadata_loaded()?.instances.is_empty() && self.cod.is_locked() {
            self.cod.force_fetch_tar(false).await?;
        }

        let tar_path = self.cod.tar_file_path().await?;
        let index_path = self.cod.index_file_path()?;

        // Resolve member ids first; this forces each instance's truths (and
        // its local bytes) so the packing below never touches the store.
        let mut staged: Vec<(Instance, String)> = Vec::new();
        for mut instance in new {
            let member_id = if hashed {
                instance.hashed_instance_uid(&client, false).await
            } else {
                instance.instance_uid(&client, false).await
            };
            match member_id {
                Ok(uid) => staged.push((instance, uid)),
                Err(err) => {
                    tracing::error!(uri = %instance.uri(), %err, "failed to resolve member id");
                    self.result.errors.push((instance, err));
                }
            }
        }

        // Tar writes, magic scans, and the index rebuild are all blocking
        // file work; run the whole packing phase off the async executor.
        let (packed, pack_errors) = {
            let tar_path = tar_path.clone();
            let index_path = index_path.clone();
            tokio::task::spawn_blocking(
                move || -> Result<(Vec<(Instance, String)>, Vec<(Instance, Error)>)> {
                    let mut builder = archive::open_append(&tar_path)?;
                    let mut packed = Vec::new();
                    let mut errors = Vec::new();
                    for (mut instance, member_id) in staged {
                        match instance.append_to_tar(&mut builder, &tar_path, &member_id) {
                            Ok(()) => packed.push((instance, member_id)),
                            Err(err) => {
                                tracing::error!(uri = %instance.uri(), %err, "failed to pack instance");
                                errors.push((instance, err));
                            }
                        }
                    }
                    archive::finish(builder)?;
                    if !packed.is_empty() {
                        index::build(&tar_path, &index_path)?;
                    }
                    Ok((packed, errors))
                },
            )
            .await??
        };
        self.result.errors.extend(pack_errors);

        if packed.is_empty() {
            return Err(Error::TarPackingFailed(self.cod.tar_uri()));
        }
        tracing::info!(
            tar = %tar_path.display(),
            bytes = tokio::fs::metadata(&tar_path).await?.len(),
            "populated series tar"
        );
        self.cod.mark_tar_dirty();

        // Metadata updates happen only for instances that actually landed
        // in the tar; errors past this point represent a tar/metadata
        // desync and must bubble up.
        for (mut instance, member_id) in packed {
            let origin = instance.uri().to_string();
            let output_uri = format!("{}://instances/{member_id}.dcm", self.cod.tar_uri());
            instance.extract_metadata(&client, &output_uri).await?;
            instance.set_uri(output_uri);
            self.cod
                .metadata_loaded_mut()?
                .instances
                .insert(member_id, instance.clone());
            if opts.delete_local_origin && !uri::is_remote(&origin) {
                if let Err(err) = tokio::fs::remove_file(&origin).await {
                    tracing::warn!(%origin, %err, "failed to delete local origin");
                }
            }
            self.result.new.push(instance);
        }
        self.cod.mark_metadata_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cod_object::{CODObject, OpenOptions};
    use crate::store::mem::MemStore;
    use crate::store::{ObjectStore, StorageClass};
    use crate::testing::{dicom_bytes, StubDicom, StubDicomFile};
    use crate::Client;
    use std::path::Path;
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
    async fn batch_dedupe_partitions_the_input() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let file = StubDicomFile::new(STUDY, SERIES, SOP);

        let original = local_instance(dir.path(), "a.dcm", &file);
        // Identical bytes under another name: a true in-batch duplicate.
        let true_dupe = local_instance(dir.path(), "b.dcm", &file);
        // Same identity, different content, remote: an in-batch conflict.
        let conflicting = file
            .clone()
            .with_tag("00080008", "CS", serde_json::json!("DERIVED"));
        let conflict_uri = "gs://imaging-ingest/incoming/conflict.dcm";
        store
            .put(conflict_uri, dicom_bytes(&conflicting).into(), Default::default())
            .await
            .unwrap();

        let mut cod = open_locked(&client).await;
        let result = cod
            .append(
                vec![original, true_dupe, Instance::new(conflict_uri)],
                &AppendOptions::default(),
                false,
            )
            .await
            .unwrap();

        // |new| + |same| + |conflict| + |errors| partitions the batch.
        assert_eq!(result.new.len(), 1);
        assert_eq!(result.same.len(), 1);
        assert_eq!(result.conflict.len(), 1);
        assert!(result.errors.is_empty());

        // The kept instance carries the remote conflict's address.
        let metadata = cod.metadata_loaded().unwrap();
        assert_eq!(
            metadata.instances[SOP].diff_hash_dupe_paths(),
            [conflict_uri.to_string()]
        );
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_instances_are_errors() {
        let (_store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let foreign = StubDicomFile::new(STUDY, "9.9.9.9.9.9.9.9.9.9", SOP);
        let instance = local_instance(dir.path(), "a.dcm", &foreign);

        let mut cod = open_locked(&client).await;
        let result = cod
            .append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        assert!(result.new.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(result.errors[0].1, Error::NotInSeries { .. }));
        cod.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_batch_after_filtering_touches_nothing() {
        let (store, client) = client_with_store();
        let mut cod = open_locked(&client).await;
        let result = cod
            .append(Vec::new(), &AppendOptions::default(), false)
            .await
            .unwrap();
        assert!(result.new.is_empty() && result.errors.is_empty());
        assert!(store.head(&cod.tar_uri()).await.unwrap().is_none());
        cod.close().await.unwrap();
    }

    #[tokio::test]
    async fn hashed_series_keys_instances_by_hashed_uid() {
        let (_store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        let hash = |uid: &str| format!("{uid}.99");

        let instance = local_instance(
            dir.path(),
            "a.dcm",
            &StubDicomFile::new(STUDY, SERIES, SOP),
        )
        .with_uid_hash(Arc::new(hash));

        let mut cod = CODObject::open(
            client.clone(),
            DATASTORE,
            hash(STUDY),
            hash(SERIES),
            OpenOptions {
                lock: true,
                hashed_uids: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let result = cod
            .append(vec![instance], &AppendOptions::default(), false)
            .await
            .unwrap();
        assert_eq!(result.new.len(), 1);

        let hashed_sop = format!("{SOP}.99");
        let metadata = cod.metadata_loaded().unwrap();
        assert!(metadata.is_hashed);
        assert!(metadata.instances.contains_key(&hashed_sop));
        assert_eq!(
            result.new[0].uri(),
            format!("{}://instances/{hashed_sop}.dcm", cod.tar_uri())
        );
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();
    }

    #[tokio::test]
    async fn local_origin_deletion_spares_remote_origins() {
        let (store, client) = client_with_store();
        let dir = tempfile::tempdir().unwrap();
        const SOP2: &str = "1.2.3.4.5.6.7.8.9.13";

        let local = local_instance(dir.path(), "a.dcm", &StubDicomFile::new(STUDY, SERIES, SOP));
        let local_path = local.uri().to_string();
        let remote_uri = "gs://imaging-ingest/incoming/b.dcm";
        store
            .put(
                remote_uri,
                dicom_bytes(&StubDicomFile::new(STUDY, SERIES, SOP2)).into(),
                Default::default(),
            )
            .await
            .unwrap();

        let mut cod = open_locked(&client).await;
        let result = cod
            .append(
                vec![local, Instance::new(remote_uri)],
                &AppendOptions {
                    delete_local_origin: true,
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(result.new.len(), 2);
        assert!(!Path::new(&local_path).exists());
        assert!(store.head(remote_uri).await.unwrap().is_some());
        cod.sync(StorageClass::Standard).await.unwrap();
        cod.close().await.unwrap();
    }
}
