//! The series-level metadata document: the identity of a series, its packed
//! instances in insertion order, and any caller-defined custom tags. The
//! canonical copy lives in the object store as gzipped JSON; this module
//! owns both directions of that encoding.

use crate::error::Error;
use crate::instance::{Instance, InstanceRecordV1};
use crate::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::io::Read;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMetadata {
    pub study_uid: String,
    pub series_uid: String,
    /// Whether the UIDs above are de-identified. Controls the key names
    /// used on the wire (`deid_study_uid` vs `study_uid`); inferred from
    /// them on load.
    pub is_hashed: bool,
    /// Instance records keyed by (possibly de-identified) instance UID.
    /// Insertion order is preserved and is the default iteration order.
    pub instances: IndexMap<String, Instance>,
    /// Any top-level keys beyond the series identity and the `cod` block
    /// round-trip here untouched.
    pub custom_tags: Map<String, Value>,
}

impl SeriesMetadata {
    pub fn new(study_uid: impl Into<String>, series_uid: impl Into<String>, is_hashed: bool) -> Self {
        SeriesMetadata {
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
            is_hashed,
            instances: IndexMap::new(),
            custom_tags: Map::new(),
        }
    }

    /// Total size in bytes of all packed instances.
    pub fn total_size(&self) -> u64 {
        self.instances
            .values()
            .filter_map(|i| i.size_cached())
            .sum()
    }

    fn study_key(&self) -> &'static str {
        if self.is_hashed {
            "deid_study_uid"
        } else {
            "study_uid"
        }
    }

    fn series_key(&self) -> &'static str {
        if self.is_hashed {
            "deid_series_uid"
        } else {
            "series_uid"
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let mut root = Map::new();
        root.insert(self.study_key().to_string(), self.study_uid.clone().into());
        root.insert(
            self.series_key().to_string(),
            self.series_uid.clone().into(),
        );

        let mut instances = Map::new();
        for (uid, instance) in &self.instances {
            instances.insert(uid.clone(), serde_json::to_value(instance.to_record()?)?);
        }
        let mut cod = Map::new();
        cod.insert("instances".to_string(), Value::Object(instances));
        root.insert("cod".to_string(), Value::Object(cod));

        for (key, value) in &self.custom_tags {
            if root.contains_key(key) {
                tracing::warn!(%key, "custom tag collides with a reserved key; dropping");
                continue;
            }
            root.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(root))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let mut root = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::Metadata(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };

        let (is_hashed, study_uid, series_uid) = if root.contains_key("deid_study_uid") {
            (
                true,
                take_string(&mut root, "deid_study_uid")?,
                take_string(&mut root, "deid_series_uid")?,
            )
        } else {
            (
                false,
                take_string(&mut root, "study_uid")?,
                take_string(&mut root, "series_uid")?,
            )
        };

        let cod = match root.remove("cod") {
            Some(Value::Object(cod)) => cod,
            Some(other) => {
                return Err(Error::Metadata(format!(
                    "expected \"cod\" to be an object, got {other}"
                )))
            }
            None => return Err(Error::Metadata("missing \"cod\" block".to_string())),
        };
        let mut instances = IndexMap::new();
        if let Some(value) = cod.get("instances") {
            let records = value.as_object().ok_or_else(|| {
                Error::Metadata("expected \"cod.instances\" to be an object".to_string())
            })?;
            for (uid, record) in records {
                let record: InstanceRecordV1 = serde_json::from_value(record.clone())?;
                instances.insert(uid.clone(), Instance::from_record(record)?);
            }
        }

        Ok(SeriesMetadata {
            study_uid,
            series_uid,
            is_hashed,
            instances,
            custom_tags: root,
        })
    }

    /// Parses a metadata blob, transparently handling the gzip layer if the
    /// bytes were not already decoded in transit.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.starts_with(&GZIP_MAGIC) {
            let mut decoded = Vec::new();
            GzDecoder::new(data).read_to_end(&mut decoded)?;
            Self::from_value(serde_json::from_slice(&decoded)?)
        } else {
            Self::from_value(serde_json::from_slice(data)?)
        }
    }

    /// Encodes to JSON directly into a gzip stream; the uncompressed form
    /// is never buffered alongside its compressed one.
    pub fn to_gzipped_json(&self) -> Result<Vec<u8>> {
        let value = self.to_value()?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, &value)?;
        Ok(encoder.finish()?)
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Result<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::Metadata(format!(
            "expected {key:?} to be a string, got {other}"
        ))),
        None => Err(Error::Metadata(format!("missing key {key:?}"))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record_json(uri: &str) -> Value {
        serde_json::json!({
            "metadata": {"00080018": {"vr": "UI", "Value": ["1.2.3"]}},
            "uri": uri,
            "headers": {"start_byte": 1536, "end_byte": 393554},
            "offset_tables": {},
            "crc32c": "MdpbMQ==",
            "size": 392018,
            "original_path": "gs://path/to/original.dcm",
            "dependencies": ["gs://path/to/original.dcm"],
            "diff_hash_dupe_paths": [],
            "version": "1.0",
            "modified_datetime": "2025-02-26T01:25:49.250660",
        })
    }

    fn sample_value(deid: bool) -> Value {
        let (study_key, series_key) = if deid {
            ("deid_study_uid", "deid_series_uid")
        } else {
            ("study_uid", "series_uid")
        };
        serde_json::json!({
            study_key: "1.2.3.4.5.6.7.8.9.10",
            series_key: "1.2.3.4.5.6.7.8.9.11",
            "cod": {
                "instances": {
                    "1.2.3.4.5.6.7.8.9.12": record_json("gs://b/s.tar://instances/1.2.3.4.5.6.7.8.9.12.dcm"),
                    "1.2.3.4.5.6.7.8.9.13": record_json("gs://b/s.tar://instances/1.2.3.4.5.6.7.8.9.13.dcm"),
                },
            },
            "thumbnail": {"uri": "gs://b/thumb.webp", "version": "0.2"},
        })
    }

    #[test]
    fn round_trip_preserves_everything() {
        let value = sample_value(false);
        let metadata = SeriesMetadata::from_value(value.clone()).unwrap();
        assert!(!metadata.is_hashed);
        assert_eq!(metadata.study_uid, "1.2.3.4.5.6.7.8.9.10");
        assert_eq!(metadata.series_uid, "1.2.3.4.5.6.7.8.9.11");
        assert_eq!(
            metadata.custom_tags.get("thumbnail").unwrap()["uri"],
            "gs://b/thumb.webp"
        );
        assert_eq!(metadata.to_value().unwrap(), value);
    }

    #[test]
    fn deid_keys_set_the_hashed_flag() {
        let value = sample_value(true);
        let metadata = SeriesMetadata::from_value(value.clone()).unwrap();
        assert!(metadata.is_hashed);
        assert_eq!(metadata.to_value().unwrap(), value);
    }

    #[test]
    fn insertion_order_survives_the_wire() {
        let metadata = SeriesMetadata::from_value(sample_value(false)).unwrap();
        let uids: Vec<&String> = metadata.instances.keys().collect();
        assert_eq!(uids, ["1.2.3.4.5.6.7.8.9.12", "1.2.3.4.5.6.7.8.9.13"]);
    }

    #[test]
    fn gzip_round_trip() {
        let metadata = SeriesMetadata::from_value(sample_value(false)).unwrap();
        let compressed = metadata.to_gzipped_json().unwrap();
        assert!(compressed.starts_with(&GZIP_MAGIC));
        let reloaded = SeriesMetadata::from_bytes(&compressed).unwrap();
        assert_eq!(reloaded, metadata);

        // Pre-decoded bytes parse too.
        let plain = serde_json::to_vec(&metadata.to_value().unwrap()).unwrap();
        assert_eq!(SeriesMetadata::from_bytes(&plain).unwrap(), metadata);
    }

    #[test]
    fn missing_identity_is_an_error() {
        let err = SeriesMetadata::from_value(serde_json::json!({"cod": {"instances": {}}}))
            .unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }

    #[test]
    fn missing_cod_block_is_an_error() {
        let err = SeriesMetadata::from_value(serde_json::json!({
            "study_uid": "1.2.3.4.5.6.7.8.9.10",
            "series_uid": "1.2.3.4.5.6.7.8.9.11",
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }

    #[test]
    fn total_size_sums_instances() {
        let metadata = SeriesMetadata::from_value(sample_value(false)).unwrap();
        assert_eq!(metadata.total_size(), 2 * 392018);
    }
}
