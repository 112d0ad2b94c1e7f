//! The read-side query router: parses DICOMweb-style `GET` URIs against a
//! datastore and serves metadata views from stored series artifacts.
//!
//! Reference: <https://www.dicomstandard.org/using/dicomweb>

use cod::{CODObject, Client, OpenOptions};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

lazy_static! {
    static ref UID_RE: Regex = Regex::new(r"^[0-9]+(\.[0-9]+)*$").expect("uid regex compiles");
}

/// Header tags constant across a study, served for study-level requests.
const STUDY_LEVEL_TAGS: [&str; 11] = [
    "0020000D", // StudyInstanceUID
    "00080020", // StudyDate
    "00080030", // StudyTime
    "00080050", // AccessionNumber
    "00080090", // ReferringPhysicianName
    "00081030", // StudyDescription
    "00100010", // PatientName
    "00100020", // PatientID
    "00100030", // PatientBirthDate
    "00100040", // PatientSex
    "00200010", // StudyID
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("only GET requests are supported")]
    MethodNotAllowed,
    #[error("query parameters are not supported")]
    QueryNotSupported,
    #[error("frame-level requests are not supported")]
    FramesNotSupported,
    #[error("invalid request path: {0}")]
    InvalidPath(String),
    #[error("invalid uid: {0}")]
    InvalidUid(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("study has no series: {0}")]
    EmptyStudy(String),
    #[error(transparent)]
    Cod(#[from] cod::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A parsed read request. Presence of the optional parts determines the
/// query level: study, series, or instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomwebRequest {
    pub datastore_uri: String,
    pub study_uid: String,
    pub series_uid: Option<String>,
    pub instance_uid: Option<String>,
    pub frames: Option<String>,
}

/// Parses a request of the form
/// `GET <datastore>/studies/<study>[/series/<series>[/instances/<instance>
/// [/frames/<list>]]][/metadata]`.
pub fn parse_request(request: &str) -> Result<DicomwebRequest> {
    let uri = request
        .strip_prefix("GET ")
        .ok_or(Error::MethodNotAllowed)?
        .trim();
    if uri.contains('?') {
        return Err(Error::QueryNotSupported);
    }
    let at = uri
        .find("/studies/")
        .ok_or_else(|| Error::InvalidPath(uri.to_string()))?;
    let datastore_uri = uri[..at].trim_end_matches('/').to_string();

    let mut parts: Vec<&str> = uri[at + 1..].split('/').filter(|s| !s.is_empty()).collect();
    if parts.last() == Some(&"metadata") {
        parts.pop();
    }
    if parts.len() % 2 != 0 {
        return Err(Error::InvalidPath(uri.to_string()));
    }

    let mut study_uid = None;
    let mut series_uid = None;
    let mut instance_uid = None;
    let mut frames = None;
    for (level, pair) in parts.chunks(2).enumerate() {
        let (keyword, value) = (pair[0], pair[1]);
        match (level, keyword) {
            (0, "studies") => study_uid = Some(validate_uid(value)?),
            (1, "series") => series_uid = Some(validate_uid(value)?),
            (2, "instances") => instance_uid = Some(validate_uid(value)?),
            (3, "frames") => frames = Some(value.to_string()),
            _ => return Err(Error::InvalidPath(uri.to_string())),
        }
    }
    Ok(DicomwebRequest {
        datastore_uri,
        study_uid: study_uid.ok_or_else(|| Error::InvalidPath(uri.to_string()))?,
        series_uid,
        instance_uid,
        frames,
    })
}

fn validate_uid(value: &str) -> Result<String> {
    if UID_RE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(Error::InvalidUid(value.to_string()))
    }
}

/// Parses and serves a read request against the datastore.
pub async fn handle_request(client: &Client, request: &str) -> Result<Value> {
    let request = parse_request(request)?;
    tracing::debug!(?request, "handling dicomweb request");
    if request.frames.is_some() {
        return Err(Error::FramesNotSupported);
    }
    match (&request.series_uid, &request.instance_uid) {
        (Some(_), Some(_)) => handle_instance_level(client, &request).await,
        (Some(_), None) => handle_series_level(client, &request).await,
        (None, _) => handle_study_level(client, &request).await,
    }
}

async fn open_series(
    client: &Client,
    datastore_uri: &str,
    study_uid: &str,
    series_uid: &str,
) -> Result<CODObject> {
    Ok(CODObject::open(
        client.clone(),
        datastore_uri,
        study_uid,
        series_uid,
        OpenOptions {
            create_if_missing: false,
            ..Default::default()
        },
    )
    .await?)
}

/// Instance level: that instance's full header tag map.
async fn handle_instance_level(client: &Client, request: &DicomwebRequest) -> Result<Value> {
    let series_uid = match &request.series_uid {
        Some(uid) => uid,
        None => unreachable!("instance level implies a series uid"),
    };
    let instance_uid = match &request.instance_uid {
        Some(uid) => uid,
        None => unreachable!("instance level implies an instance uid"),
    };
    let mut cod = open_series(client, &request.datastore_uri, &request.study_uid, series_uid).await?;
    let metadata = cod.get_metadata(false, true).await?;
    let tags = metadata
        .instances
        .get(instance_uid)
        .and_then(|instance| instance.metadata())
        .ok_or_else(|| Error::InstanceNotFound(instance_uid.clone()))?;
    Ok(Value::Object(tags.clone()))
}

/// Series level: per-instance tag maps, in insertion order.
async fn handle_series_level(client: &Client, request: &DicomwebRequest) -> Result<Value> {
    let series_uid = match &request.series_uid {
        Some(uid) => uid,
        None => unreachable!("series level implies a series uid"),
    };
    let mut cod = open_series(client, &request.datastore_uri, &request.study_uid, series_uid).await?;
    let metadata = cod.get_metadata(false, true).await?;
    let instances: Vec<Value> = metadata
        .instances
        .values()
        .filter_map(|instance| instance.metadata())
        .map(|tags| Value::Object(tags.clone()))
        .collect();
    Ok(Value::Array(instances))
}

/// Study level: tags constant across the study, read from any one series.
async fn handle_study_level(client: &Client, request: &DicomwebRequest) -> Result<Value> {
    let prefix = format!(
        "{}/studies/{}/series/",
        request.datastore_uri.trim_end_matches('/'),
        request.study_uid
    );
    let blobs = client.store.list(&prefix).await.map_err(cod::Error::Store)?;
    let series_uid = blobs
        .iter()
        .filter_map(|blob| blob.rsplit('/').next())
        .filter_map(|name| name.strip_suffix(".tar"))
        .next()
        .ok_or_else(|| Error::EmptyStudy(request.study_uid.clone()))?
        .to_string();

    let mut cod = open_series(client, &request.datastore_uri, &request.study_uid, &series_uid).await?;
    let metadata = cod.get_metadata(false, true).await?;
    let tags = metadata
        .instances
        .values()
        .filter_map(|instance| instance.metadata())
        .next()
        .ok_or_else(|| Error::EmptyStudy(request.study_uid.clone()))?;

    let study_tags: Map<String, Value> = tags
        .iter()
        .filter(|(tag, _)| STUDY_LEVEL_TAGS.contains(&tag.as_str()))
        .map(|(tag, value)| (tag.clone(), value.clone()))
        .collect();
    Ok(Value::Object(study_tags))
}
