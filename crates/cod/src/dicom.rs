//! The file-format seam. Parsing DICOM proper is delegated to an injected
//! [`DicomAdapter`]; this module owns only the packing-level concerns: the
//! preamble magic and the windowed scan used to locate instance bytes inside
//! a tar.

use serde_json::{Map, Value};
use std::io::Read;

/// Every DICOM part-10 file begins with 128 zero bytes followed by `DICM`.
pub const DICOM_MAGIC: &[u8] = b"DICM";
pub const DICOM_PREAMBLE_LEN: usize = 132;

/// The full 132-byte preamble pattern scanned for at pack time.
pub const DICOM_PREAMBLE: [u8; DICOM_PREAMBLE_LEN] = {
    let mut p = [0u8; DICOM_PREAMBLE_LEN];
    p[128] = b'D';
    p[129] = b'I';
    p[130] = b'C';
    p[131] = b'M';
    p
};

#[derive(Debug, thiserror::Error)]
pub enum DicomError {
    #[error("DICOM magic not found")]
    NotDicom,
    #[error("malformed DICOM stream: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The handful of header facts the engine needs from a parsed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomSummary {
    pub instance_uid: String,
    pub series_uid: String,
    pub study_uid: String,
    pub has_pixel_data: bool,
}

/// Substitutes an out-of-band bulk element during tag extraction. Receives
/// the element's tag and raw bytes; returns the JSON value stored in its
/// place.
pub type BulkDataHandler<'a> = &'a mut dyn FnMut(&str, &[u8]) -> Value;

/// Contract for the external DICOM parser.
pub trait DicomAdapter: Send + Sync {
    /// Reads identity UIDs and the pixel-payload flag from a byte stream.
    fn parse(&self, reader: &mut dyn Read) -> Result<DicomSummary, DicomError>;

    /// Extracts the full header tag map, passing each bulk element through
    /// `bulk` rather than inlining its bytes.
    fn extract_tags(
        &self,
        reader: &mut dyn Read,
        bulk: BulkDataHandler<'_>,
    ) -> Result<Map<String, Value>, DicomError>;
}

/// Scans `reader` for `pattern`, returning the offset of its first
/// occurrence relative to the reader's starting position.
pub(crate) fn find_pattern<R: Read>(
    reader: &mut R,
    pattern: &[u8],
) -> std::io::Result<Option<u64>> {
    const CHUNK: usize = 8192;
    let finder = memchr::memmem::Finder::new(pattern);
    let overlap = pattern.len().saturating_sub(1);
    let mut buf = vec![0u8; CHUNK + overlap];
    let mut carry = 0usize;
    // Absolute offset of buf[0] within the scanned stream.
    let mut base = 0u64;
    loop {
        let n = reader.read(&mut buf[carry..])?;
        if n == 0 {
            return Ok(None);
        }
        let hay = carry + n;
        if let Some(at) = finder.find(&buf[..hay]) {
            return Ok(Some(base + at as u64));
        }
        let keep = overlap.min(hay);
        base += (hay - keep) as u64;
        buf.copy_within(hay - keep..hay, 0);
        carry = keep;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn preamble_shape() {
        assert_eq!(DICOM_PREAMBLE.len(), DICOM_PREAMBLE_LEN);
        assert!(DICOM_PREAMBLE[..128].iter().all(|b| *b == 0));
        assert_eq!(&DICOM_PREAMBLE[128..], DICOM_MAGIC);
    }

    #[test]
    fn finds_pattern_within_chunk() {
        let mut data = vec![0xFFu8; 100];
        data.extend_from_slice(&DICOM_PREAMBLE);
        data.extend_from_slice(b"payload");
        let found = find_pattern(&mut data.as_slice(), &DICOM_PREAMBLE).unwrap();
        assert_eq!(found, Some(100));
    }

    #[test]
    fn finds_pattern_straddling_chunks() {
        // Place the pattern across the 8192-byte read boundary.
        let mut data = vec![0xAAu8; 8190];
        data.extend_from_slice(&DICOM_PREAMBLE);
        data.extend_from_slice(&[0xBB; 64]);
        let found = find_pattern(&mut data.as_slice(), &DICOM_PREAMBLE).unwrap();
        assert_eq!(found, Some(8190));
    }

    #[test]
    fn absent_pattern_reports_none() {
        let data = vec![1u8; 20000];
        let found = find_pattern(&mut data.as_slice(), &DICOM_PREAMBLE).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn zero_run_does_not_shift_the_match() {
        // Zeros preceding the preamble must not move the reported offset:
        // the match is anchored by the DICM magic at offset +128.
        let mut data = vec![0u8; 500];
        data.extend_from_slice(&DICOM_PREAMBLE);
        let found = find_pattern(&mut data.as_slice(), &DICOM_PREAMBLE).unwrap();
        // First position where 128 zeros are followed by DICM.
        assert_eq!(found, Some(500));
    }
}
