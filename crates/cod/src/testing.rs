//! Test support shared by the workspace: an in-memory client and a stub
//! DICOM codec speaking the DICOM JSON model behind a real part-10
//! preamble. Not intended for production use.

use crate::dicom::{BulkDataHandler, DicomAdapter, DicomError, DicomSummary, DICOM_PREAMBLE, DICOM_PREAMBLE_LEN};
use crate::store::mem::MemStore;
use crate::Client;
use serde_json::{Map, Value};
use std::io::Read;
use std::sync::Arc;

pub const TAG_SOP_INSTANCE_UID: &str = "00080018";
pub const TAG_STUDY_INSTANCE_UID: &str = "0020000D";
pub const TAG_SERIES_INSTANCE_UID: &str = "0020000E";
pub const TAG_PIXEL_DATA: &str = "7FE00010";

/// A synthetic instance: a tag map rendered behind the standard preamble.
#[derive(Debug, Clone)]
pub struct StubDicomFile {
    tags: Map<String, Value>,
}

impl StubDicomFile {
    pub fn new(study_uid: &str, series_uid: &str, instance_uid: &str) -> Self {
        let mut tags = Map::new();
        tags.insert(
            TAG_SOP_INSTANCE_UID.to_string(),
            uid_element(instance_uid),
        );
        tags.insert(TAG_STUDY_INSTANCE_UID.to_string(), uid_element(study_uid));
        tags.insert(TAG_SERIES_INSTANCE_UID.to_string(), uid_element(series_uid));
        StubDicomFile { tags }
    }

    /// Adds an arbitrary header tag, e.g. to vary content between two files
    /// sharing the same identity.
    pub fn with_tag(mut self, tag: &str, vr: &str, value: Value) -> Self {
        self.tags.insert(
            tag.to_string(),
            serde_json::json!({"vr": vr, "Value": [value]}),
        );
        self
    }

    /// Adds a pixel-data element carried out of band at extraction time.
    pub fn with_pixel_data(mut self, payload: &str) -> Self {
        self.tags.insert(
            TAG_PIXEL_DATA.to_string(),
            serde_json::json!({"vr": "OB", "BulkValue": payload}),
        );
        self
    }
}

fn uid_element(uid: &str) -> Value {
    serde_json::json!({"vr": "UI", "Value": [uid]})
}

/// Renders a stub file to bytes: 132-byte preamble, then the tag map.
pub fn dicom_bytes(file: &StubDicomFile) -> Vec<u8> {
    let mut out = DICOM_PREAMBLE.to_vec();
    out.extend_from_slice(&serde_json::to_vec(&file.tags).expect("tag map serializes"));
    out
}

/// Adapter for the stub encoding.
#[derive(Debug, Default)]
pub struct StubDicom;

impl StubDicom {
    fn read_tags(reader: &mut dyn Read) -> Result<Map<String, Value>, DicomError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        if data.len() < DICOM_PREAMBLE_LEN || data[..DICOM_PREAMBLE_LEN] != DICOM_PREAMBLE {
            return Err(DicomError::NotDicom);
        }
        match serde_json::from_slice(&data[DICOM_PREAMBLE_LEN..]) {
            Ok(Value::Object(tags)) => Ok(tags),
            Ok(_) => Err(DicomError::Malformed("expected a tag object".to_string())),
            Err(err) => Err(DicomError::Malformed(err.to_string())),
        }
    }

    fn uid(tags: &Map<String, Value>, tag: &str) -> Result<String, DicomError> {
        tags.get(tag)
            .and_then(|t| t.get("Value"))
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| DicomError::Malformed(format!("missing uid tag {tag}")))
    }
}

impl DicomAdapter for StubDicom {
    fn parse(&self, reader: &mut dyn Read) -> Result<DicomSummary, DicomError> {
        let tags = Self::read_tags(reader)?;
        Ok(DicomSummary {
            instance_uid: Self::uid(&tags, TAG_SOP_INSTANCE_UID)?,
            series_uid: Self::uid(&tags, TAG_SERIES_INSTANCE_UID)?,
            study_uid: Self::uid(&tags, TAG_STUDY_INSTANCE_UID)?,
            has_pixel_data: tags.contains_key(TAG_PIXEL_DATA),
        })
    }

    fn extract_tags(
        &self,
        reader: &mut dyn Read,
        bulk: BulkDataHandler<'_>,
    ) -> Result<Map<String, Value>, DicomError> {
        let tags = Self::read_tags(reader)?;
        let mut out = Map::new();
        for (tag, element) in tags {
            let payload = element
                .get("BulkValue")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let substituted = match payload {
                Some(payload) => bulk(&tag, payload.as_bytes()),
                None => element,
            };
            out.insert(tag, substituted);
        }
        Ok(out)
    }
}

/// A fresh [`Client`] over an empty in-memory store and the stub codec.
pub fn test_client() -> Client {
    Client::new(Arc::new(MemStore::new()), Arc::new(StubDicom))
}

/// Routes engine logs to the test harness, honoring `RUST_LOG`. Safe to
/// call from every test; only the first installation wins.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
