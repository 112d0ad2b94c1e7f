use crate::dicom::DicomError;
use crate::store::StoreError;

/// Error type returned by all series-packing operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to acquire series lock: {0}")]
    LockAcquisitionFailed(String),

    #[error("lock verification failed: {0}")]
    LockVerificationFailed(String),

    #[error("series not found: {0} (create_if_missing = false)")]
    SeriesNotFound(String),

    #[error("cannot initialize series; error log exists: {0}")]
    ErrorLogExists(String),

    #[error("invalid uid {uid:?}: {reason}")]
    InvalidUid { uid: String, reason: &'static str },

    #[error("overlarge instance: {uri} ({size} bytes) exceeds max_instance_size {limit_gb} gb")]
    OverlargeInstance {
        uri: String,
        size: u64,
        limit_gb: f64,
    },

    #[error("overlarge series: {series} ({size} bytes) exceeds max_series_size {limit_gb} gb")]
    OverlargeSeries {
        series: String,
        size: u64,
        limit_gb: f64,
    },

    #[error("{field} mismatch: hint {hint:?} != actual {actual:?}")]
    HintMismatch {
        field: &'static str,
        hint: String,
        actual: String,
    },

    #[error("DICOM magic not found in {0}")]
    NotDicom(String),

    #[error("tar does not contain instance {0}")]
    TarMissingInstance(String),

    #[error("crc32c mismatch for {uri}: computed {computed} != recorded {expected}")]
    HashMismatch {
        uri: String,
        computed: String,
        expected: String,
    },

    #[error("clean operation {0:?} requires a locked series object")]
    CleanOpWithoutLock(&'static str),

    #[error("failed to pack any instance into {0}")]
    TarPackingFailed(String),

    #[error("tar sync attempted but index does not exist: {0}")]
    IndexMissing(String),

    #[error("identity mismatch appending diff-hash dupe {dupe} to {existing}")]
    DupeIdentityMismatch { existing: String, dupe: String },

    #[error("nested dependency cannot be deleted: {0}")]
    NestedDependency(String),

    #[error("instance {instance} does not belong to series {series}")]
    NotInSeries { instance: String, series: String },

    #[error("series uses hashed uids but instance {0} has no uid transform")]
    MissingUidHash(String),

    #[error("instance {0} is packed in a tar; open it via its series object")]
    PackedInstance(String),

    #[error("malformed series metadata: {0}")]
    Metadata(String),

    #[error("blocking task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dicom(#[from] DicomError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Index(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
