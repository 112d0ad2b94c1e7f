//! Cloud-optimized storage for DICOM series. Every instance of a series is
//! packed into a single tar in the object store, alongside gzipped JSON
//! metadata and a sqlite random-access index, with writers serialized by a
//! generation-checked lock blob.

mod appender;
mod archive;
mod cod_object;
mod counters;
pub mod dicom;
mod error;
mod hints;
pub mod index;
mod instance;
mod locker;
mod metadata;
pub mod store;
pub mod testing;
mod uri;

pub use appender::{AppendOptions, AppendResult};
pub use archive::EMPTY_TAR_SIZE;
pub use cod_object::{CODObject, CODSnapshot, OpenOptions};
pub use dicom::{DicomAdapter, DicomError, DicomSummary};
pub use error::Error;
pub use hints::Hints;
pub use instance::{Instance, UidHashFn};
pub use locker::{Locker, LOCK_FILE_NAME};
pub use metadata::SeriesMetadata;
pub use store::{BlobMeta, ObjectStore, PutOptions, StorageClass, StoreError};
pub use uri::is_remote;

use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// The injected collaborators every operation runs against: the blob store
/// holding series artifacts, and the DICOM parser.
#[derive(Clone)]
pub struct Client {
    pub store: Arc<dyn ObjectStore>,
    pub dicom: Arc<dyn DicomAdapter>,
}

impl Client {
    pub fn new(store: Arc<dyn ObjectStore>, dicom: Arc<dyn DicomAdapter>) -> Self {
        Client { store, dicom }
    }
}
