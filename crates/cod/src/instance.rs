//! A lazy, cached view over one DICOM file. An instance starts as a pointer
//! to bytes somewhere (local path, remote object, or a member of a series
//! tar) and learns its truths (size, content hash, identity UIDs, pixel
//! payload) on the first real read. Once learned, truths never change.

use crate::counters;
use crate::dicom::{self, DicomError, DICOM_PREAMBLE, DICOM_PREAMBLE_LEN};
use crate::error::Error;
use crate::hints::Hints;
use crate::uri;
use crate::{Client, Result};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Caller-supplied UID de-identification transform.
pub type UidHashFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub(crate) const RECORD_VERSION: &str = "1.0";

/// Truths learned from the first real read of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Loaded {
    size: u64,
    crc32c: String,
    instance_uid: String,
    series_uid: String,
    study_uid: String,
    has_pixel_data: bool,
}

#[derive(Clone)]
pub struct Instance {
    uri: String,
    hints: Hints,
    uid_hash: Option<UidHashFn>,
    dependencies: Vec<String>,
    diff_hash_dupe_paths: Vec<String>,
    original_path: Option<String>,
    modified_datetime: String,

    /// Populated on the first real read; `None` until then.
    loaded: Option<Loaded>,
    /// Values resurrected from persisted metadata, available without a read.
    recorded_size: Option<u64>,
    recorded_crc32c: Option<String>,

    metadata: Option<Map<String, Value>>,
    custom_offset_tables: Map<String, Value>,
    byte_offsets: Option<(u64, u64)>,

    local_path: Option<PathBuf>,
    temp: Option<Arc<tempfile::NamedTempFile>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("uri", &self.uri)
            .field("loaded", &self.loaded.is_some())
            .field("byte_offsets", &self.byte_offsets)
            .finish()
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Instance({})", self.uri)
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
            && self.dependencies == other.dependencies
            && self.diff_hash_dupe_paths == other.diff_hash_dupe_paths
            && self.original_path == other.original_path
            && self.modified_datetime == other.modified_datetime
            && self.size_cached() == other.size_cached()
            && self.crc32c_cached() == other.crc32c_cached()
            && self.metadata == other.metadata
            && self.custom_offset_tables == other.custom_offset_tables
            && self.byte_offsets == other.byte_offsets
    }
}

impl Instance {
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let local_path = if uri::is_remote(&uri) || uri::is_nested(&uri) {
            None
        } else {
            Some(PathBuf::from(&uri))
        };
        Instance {
            local_path,
            uri,
            hints: Hints::default(),
            uid_hash: None,
            dependencies: Vec::new(),
            diff_hash_dupe_paths: Vec::new(),
            original_path: None,
            modified_datetime: now_stamp(),
            loaded: None,
            recorded_size: None,
            recorded_crc32c: None,
            metadata: None,
            custom_offset_tables: Map::new(),
            byte_offsets: None,
            temp: None,
        }
    }

    pub fn with_hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_uid_hash(mut self, uid_hash: UidHashFn) -> Self {
        self.uid_hash = Some(uid_hash);
        self
    }

    pub fn with_original_path(mut self, original_path: impl Into<String>) -> Self {
        self.original_path = Some(original_path.into());
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn diff_hash_dupe_paths(&self) -> &[String] {
        &self.diff_hash_dupe_paths
    }

    pub fn original_path(&self) -> Option<&str> {
        self.original_path.as_deref()
    }

    pub fn modified_datetime(&self) -> &str {
        &self.modified_datetime
    }

    /// Header tag map extracted at pack time, if any.
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata.as_ref()
    }

    /// `[start, stop)` of this instance's bytes inside its series tar.
    pub fn byte_offsets(&self) -> Option<(u64, u64)> {
        self.byte_offsets
    }

    pub fn is_remote(&self) -> bool {
        uri::is_remote(&self.uri)
    }

    pub(crate) fn set_uri(&mut self, uri: String) {
        self.uri = uri;
    }

    pub(crate) fn size_cached(&self) -> Option<u64> {
        self.loaded.as_ref().map(|l| l.size).or(self.recorded_size)
    }

    pub(crate) fn crc32c_cached(&self) -> Option<String> {
        self.loaded
            .as_ref()
            .map(|l| l.crc32c.clone())
            .or_else(|| self.recorded_crc32c.clone())
    }

    /// Ensures the raw bytes are available locally. Remote objects are
    /// streamed to a unique temp file once; repeat calls are no-ops.
    pub async fn fetch(&mut self, client: &Client) -> Result<()> {
        if let Some(path) = &self.local_path {
            if tokio::fs::metadata(path).await.is_ok() {
                return Ok(());
            }
        }
        if uri::is_nested(&self.uri) {
            return Err(Error::PackedInstance(self.uri.clone()));
        }
        if !self.is_remote() {
            let path = PathBuf::from(&self.uri);
            if tokio::fs::metadata(&path).await.is_err() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("local instance does not exist: {}", self.uri),
                )));
            }
            self.local_path = Some(path);
            return Ok(());
        }
        let temp = tempfile::Builder::new().suffix(".dcm").tempfile()?;
        client.store.get_to_file(&self.uri, temp.path()).await?;
        tracing::debug!(uri = %self.uri, local = %temp.path().display(), "fetched instance");
        self.local_path = Some(temp.path().to_path_buf());
        self.temp = Some(Arc::new(temp));
        Ok(())
    }

    /// Opens the raw DICOM bytes. Instances packed inside a tar must be read
    /// through their series object, which owns the tar and its index.
    pub async fn open(&mut self, client: &Client) -> Result<File> {
        self.fetch(client).await?;
        let path = self.require_local()?;
        Ok(File::open(path)?)
    }

    fn require_local(&self) -> Result<&Path> {
        self.local_path
            .as_deref()
            .ok_or_else(|| Error::PackedInstance(self.uri.clone()))
    }

    async fn ensure_loaded(&mut self, client: &Client) -> Result<&Loaded> {
        if self.loaded.is_none() {
            let loaded = self.load_truths(client).await?;
            self.loaded = Some(loaded);
        }
        match &self.loaded {
            Some(loaded) => Ok(loaded),
            None => unreachable!("truths just loaded"),
        }
    }

    async fn load_truths(&mut self, client: &Client) -> Result<Loaded> {
        self.fetch(client).await?;
        let path = self.require_local()?.to_path_buf();
        let dicom = client.dicom.clone();
        let uri = self.uri.clone();
        let hints = self.hints.clone();
        let recorded_size = self.recorded_size;
        let recorded_crc32c = self.recorded_crc32c.clone();

        // Hashing the whole file and parsing its header is blocking work;
        // keep it off the async executor.
        tokio::task::spawn_blocking(move || {
            let size = std::fs::metadata(&path)?.len();
            let crc32c = file_crc32c(&path)?;

            let mut reader = File::open(&path)?;
            let summary = dicom.parse(&mut reader).map_err(|err| match err {
                DicomError::NotDicom => Error::NotDicom(uri.clone()),
                err => Error::Dicom(err),
            })?;

            hints.validate(
                size,
                &crc32c,
                &summary.instance_uid,
                &summary.series_uid,
                &summary.study_uid,
            )?;
            if let Some(recorded) = recorded_size {
                if recorded != size {
                    return Err(Error::HintMismatch {
                        field: "recorded size",
                        hint: recorded.to_string(),
                        actual: size.to_string(),
                    });
                }
            }
            if let Some(recorded) = &recorded_crc32c {
                if recorded != &crc32c {
                    return Err(Error::HashMismatch {
                        uri,
                        computed: crc32c,
                        expected: recorded.clone(),
                    });
                }
            }

            Ok(Loaded {
                size,
                crc32c,
                instance_uid: summary.instance_uid,
                series_uid: summary.series_uid,
                study_uid: summary.study_uid,
                has_pixel_data: summary.has_pixel_data,
            })
        })
        .await?
    }

    pub async fn size(&mut self, client: &Client, trust_hints: bool) -> Result<u64> {
        if trust_hints {
            if let Some(size) = self.hints.size {
                return Ok(size);
            }
        }
        if let Some(size) = self.size_cached() {
            return Ok(size);
        }
        Ok(self.ensure_loaded(client).await?.size)
    }

    pub async fn crc32c(&mut self, client: &Client, trust_hints: bool) -> Result<String> {
        if trust_hints {
            if let Some(crc) = &self.hints.crc32c {
                return Ok(crc.clone());
            }
        }
        if let Some(crc) = self.crc32c_cached() {
            return Ok(crc);
        }
        Ok(self.ensure_loaded(client).await?.crc32c.clone())
    }

    pub async fn instance_uid(&mut self, client: &Client, trust_hints: bool) -> Result<String> {
        if trust_hints {
            if let Some(uid) = &self.hints.instance_uid {
                return Ok(uid.clone());
            }
        }
        if let Some(loaded) = &self.loaded {
            return Ok(loaded.instance_uid.clone());
        }
        Ok(self.ensure_loaded(client).await?.instance_uid.clone())
    }

    pub async fn series_uid(&mut self, client: &Client, trust_hints: bool) -> Result<String> {
        if trust_hints {
            if let Some(uid) = &self.hints.series_uid {
                return Ok(uid.clone());
            }
        }
        if let Some(loaded) = &self.loaded {
            return Ok(loaded.series_uid.clone());
        }
        Ok(self.ensure_loaded(client).await?.series_uid.clone())
    }

    pub async fn study_uid(&mut self, client: &Client, trust_hints: bool) -> Result<String> {
        if trust_hints {
            if let Some(uid) = &self.hints.study_uid {
                return Ok(uid.clone());
            }
        }
        if let Some(loaded) = &self.loaded {
            return Ok(loaded.study_uid.clone());
        }
        Ok(self.ensure_loaded(client).await?.study_uid.clone())
    }

    pub async fn has_pixel_data(&mut self, client: &Client) -> Result<bool> {
        Ok(self.ensure_loaded(client).await?.has_pixel_data)
    }

    fn apply_uid_hash(&self, raw: &str) -> Result<String> {
        match &self.uid_hash {
            Some(hash) => Ok(hash(raw)),
            None => Err(Error::MissingUidHash(self.uri.clone())),
        }
    }

    pub async fn hashed_instance_uid(
        &mut self,
        client: &Client,
        trust_hints: bool,
    ) -> Result<String> {
        let raw = self.instance_uid(client, trust_hints).await?;
        self.apply_uid_hash(&raw)
    }

    pub async fn hashed_series_uid(
        &mut self,
        client: &Client,
        trust_hints: bool,
    ) -> Result<String> {
        let raw = self.series_uid(client, trust_hints).await?;
        self.apply_uid_hash(&raw)
    }

    pub async fn hashed_study_uid(&mut self, client: &Client, trust_hints: bool) -> Result<String> {
        let raw = self.study_uid(client, trust_hints).await?;
        self.apply_uid_hash(&raw)
    }

    /// Whether this instance's (study, series) identity, hashed when the
    /// series uses de-identified UIDs, matches the given pair.
    pub(crate) async fn belongs_to(
        &mut self,
        client: &Client,
        study_uid: &str,
        series_uid: &str,
        hashed: bool,
    ) -> Result<bool> {
        let (study, series) = if hashed {
            (
                self.hashed_study_uid(client, true).await?,
                self.hashed_series_uid(client, true).await?,
            )
        } else {
            (
                self.study_uid(client, true).await?,
                self.series_uid(client, true).await?,
            )
        };
        Ok(study == study_uid && series == series_uid)
    }

    /// Writes this instance into an open series tar as member
    /// `instances/<member_id>.dcm` and records its content byte range,
    /// located by scanning for the DICOM magic from the member's start.
    ///
    /// Truths must already be loaded; the caller runs this on a blocking
    /// thread alongside the rest of its tar work.
    pub(crate) fn append_to_tar(
        &mut self,
        builder: &mut tar::Builder<File>,
        tar_path: &Path,
        member_id: &str,
    ) -> Result<()> {
        let size = match &self.loaded {
            Some(loaded) => loaded.size,
            None => {
                return Err(Error::Metadata(format!(
                    "instance {} must be loaded before packing",
                    self.uri
                )))
            }
        };
        let local = self.require_local()?.to_path_buf();

        // Refuse to pack a non-DICOM file rather than scrub it out later.
        let mut probe = File::open(&local)?;
        let mut head = [0u8; DICOM_PREAMBLE_LEN];
        probe
            .read_exact(&mut head)
            .map_err(|_| Error::NotDicom(self.uri.clone()))?;
        if head != DICOM_PREAMBLE {
            return Err(Error::NotDicom(self.uri.clone()));
        }

        let member_start = builder.get_mut().stream_position()?;
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp() as u64);
        let mut reader = File::open(&local)?;
        builder.append_data(&mut header, format!("instances/{member_id}.dcm"), &mut reader)?;
        builder.get_mut().flush()?;

        let mut scan = File::open(tar_path)?;
        scan.seek(SeekFrom::Start(member_start))?;
        let relative = dicom::find_pattern(&mut scan, &DICOM_PREAMBLE)?
            .ok_or_else(|| Error::NotDicom(self.uri.clone()))?;
        let start = member_start + relative;
        self.byte_offsets = Some((start, start + size));
        tracing::debug!(uri = %self.uri, member_id, start, size, "packed instance into tar");
        Ok(())
    }

    /// Extracts the full header tag map, substituting each out-of-band bulk
    /// element with `{uri, head}` where `head` is the element's first 512
    /// bytes rendered as UTF-8.
    pub(crate) async fn extract_metadata(&mut self, client: &Client, output_uri: &str) -> Result<()> {
        self.fetch(client).await?;
        let path = self.require_local()?.to_path_buf();
        let dicom = client.dicom.clone();
        let bulk_uri = output_uri.to_string();
        let tags = tokio::task::spawn_blocking(move || {
            let mut reader = File::open(path)?;
            let mut handler = move |_tag: &str, data: &[u8]| {
                let head = String::from_utf8_lossy(&data[..data.len().min(512)]).into_owned();
                serde_json::json!({ "uri": bulk_uri, "head": head })
            };
            dicom
                .extract_tags(&mut reader, &mut handler)
                .map_err(Error::Dicom)
        })
        .await??;
        self.metadata = Some(tags);
        Ok(())
    }

    /// Records a remote variant of this instance that carries the same
    /// identity but different content. Returns whether the list changed.
    pub async fn append_diff_hash_dupe(
        &mut self,
        client: &Client,
        dupe: &mut Instance,
    ) -> Result<bool> {
        let dupe_uid = dupe.instance_uid(client, true).await?;
        if let Some(loaded) = &self.loaded {
            if loaded.instance_uid != dupe_uid {
                return Err(Error::DupeIdentityMismatch {
                    existing: self.uri.clone(),
                    dupe: dupe.uri.clone(),
                });
            }
        }
        if !dupe.is_remote() {
            return Ok(false);
        }
        if self.diff_hash_dupe_paths.iter().any(|u| u == &dupe.uri) {
            return Ok(false);
        }
        self.diff_hash_dupe_paths.push(dupe.uri.clone());
        self.modified_datetime = now_stamp();
        Ok(true)
    }

    /// Deletes the source objects consumed to produce this instance. With a
    /// single dependency and `validate_hash`, the blob is deleted only if
    /// its CRC32C matches this instance's truth hash. Nested dependencies
    /// are never deletable.
    pub async fn delete_dependencies(&mut self, client: &Client, validate_hash: bool) -> Result<usize> {
        for dep in &self.dependencies {
            if dep.contains(".tar://") || dep.contains(".zip://") {
                counters::dependency_nested();
                return Err(Error::NestedDependency(dep.clone()));
            }
        }
        let expected = if validate_hash && self.dependencies.len() == 1 {
            Some(self.crc32c(client, false).await?)
        } else {
            None
        };
        let deps = self.dependencies.clone();
        let mut deleted = 0usize;
        for dep in deps {
            if uri::is_remote(&dep) {
                let meta = match client.store.head(&dep).await? {
                    Some(meta) => meta,
                    None => {
                        tracing::warn!(uri = %dep, "dependency does not exist; skipping deletion");
                        counters::dependency_missing();
                        continue;
                    }
                };
                if let (Some(expected), Some(actual)) = (&expected, &meta.crc32c) {
                    if expected != actual {
                        tracing::warn!(uri = %dep, "dependency hash mismatch; skipping deletion");
                        counters::dependency_hash_mismatch();
                        continue;
                    }
                }
                client.store.delete(&dep).await?;
            } else {
                if tokio::fs::metadata(&dep).await.is_err() {
                    tracing::warn!(uri = %dep, "dependency does not exist; skipping deletion");
                    counters::dependency_missing();
                    continue;
                }
                tokio::fs::remove_file(&dep).await?;
            }
            counters::dependency_deleted();
            deleted += 1;
        }
        Ok(deleted)
    }

    pub(crate) fn to_record(&self) -> Result<InstanceRecordV1> {
        let (start_byte, end_byte) = self.byte_offsets.ok_or_else(|| {
            Error::Metadata(format!("instance {} has not been packed", self.uri))
        })?;
        let missing = |what: &str| Error::Metadata(format!("instance {} has no {what}", self.uri));
        Ok(InstanceRecordV1 {
            metadata: self.metadata.clone().ok_or_else(|| missing("metadata"))?,
            uri: self.uri.clone(),
            headers: ByteRange {
                start_byte,
                end_byte,
            },
            offset_tables: self.custom_offset_tables.clone(),
            crc32c: self.crc32c_cached().ok_or_else(|| missing("crc32c"))?,
            size: self.size_cached().ok_or_else(|| missing("size"))?,
            original_path: self.original_path.clone(),
            dependencies: self.dependencies.clone(),
            diff_hash_dupe_paths: self.diff_hash_dupe_paths.clone(),
            version: RECORD_VERSION.to_string(),
            modified_datetime: self.modified_datetime.clone(),
        })
    }

    pub(crate) fn from_record(record: InstanceRecordV1) -> Result<Instance> {
        if record.version != RECORD_VERSION {
            return Err(Error::Metadata(format!(
                "unsupported instance record version {:?}",
                record.version
            )));
        }
        Ok(Instance {
            uri: record.uri,
            hints: Hints::default(),
            uid_hash: None,
            dependencies: record.dependencies,
            diff_hash_dupe_paths: record.diff_hash_dupe_paths,
            original_path: record.original_path,
            modified_datetime: record.modified_datetime,
            loaded: None,
            recorded_size: Some(record.size),
            recorded_crc32c: Some(record.crc32c),
            metadata: Some(record.metadata),
            custom_offset_tables: record.offset_tables,
            byte_offsets: Some((record.headers.start_byte, record.headers.end_byte)),
            local_path: None,
            temp: None,
        })
    }
}

/// The persisted shape of one instance inside series metadata. Every field
/// is required; unknown fields are a load error so schema drift is an
/// explicit decision rather than silent tolerance.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct InstanceRecordV1 {
    pub metadata: Map<String, Value>,
    pub uri: String,
    pub headers: ByteRange,
    pub offset_tables: Map<String, Value>,
    pub crc32c: String,
    pub size: u64,
    pub original_path: Option<String>,
    pub dependencies: Vec<String>,
    pub diff_hash_dupe_paths: Vec<String>,
    pub version: String,
    pub modified_datetime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ByteRange {
    pub start_byte: u64,
    pub end_byte: u64,
}

pub(crate) fn now_stamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Streams a file through CRC32C and renders the sum the way object stores
/// do: base64 of the big-endian checksum.
pub(crate) fn file_crc32c(path: &Path) -> std::io::Result<String> {
    reader_crc32c(&mut File::open(path)?)
}

pub(crate) fn reader_crc32c(reader: &mut impl Read) -> std::io::Result<String> {
    let mut buf = [0u8; 8192];
    let mut sum = 0u32;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sum = crc32c::crc32c_append(sum, &buf[..n]);
    }
    Ok(base64::encode(sum.to_be_bytes()))
}

/// Renders raw bytes' CRC32C in the same textual form as [`file_crc32c`].
pub(crate) fn bytes_crc32c(data: &[u8]) -> String {
    base64::encode(crc32c::crc32c(data).to_be_bytes())
}
