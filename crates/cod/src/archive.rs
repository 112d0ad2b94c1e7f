//! Local tar bookkeeping: the empty-archive sentinel, append-mode reopening,
//! and trailer handling. Tar is treated as an append-only, byte-addressable
//! container; members are never rewritten in place.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Size of an empty archive: one 10240-byte zero record, the sentinel used
/// to skip syncing a tar that was never written to.
pub const EMPTY_TAR_SIZE: u64 = 10240;

const BLOCK: u64 = 512;

/// The bytes of a fresh empty archive: one zero record. Written whenever a
/// series workspace needs a tar that can be opened in append mode.
pub(crate) fn empty_archive() -> Vec<u8> {
    vec![0u8; EMPTY_TAR_SIZE as usize]
}

/// Reopens an existing archive for appending: scans its members, seeks over
/// the zero trailer, and returns a builder positioned at end-of-data.
pub(crate) fn open_append(path: &Path) -> std::io::Result<tar::Builder<File>> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut archive = tar::Archive::new(file);
    let mut data_end = 0u64;
    for entry in archive.entries()? {
        let entry = entry?;
        let padded = (entry.size() + BLOCK - 1) / BLOCK * BLOCK;
        data_end = entry.raw_file_position() + padded;
    }
    let mut file = archive.into_inner();
    file.seek(SeekFrom::Start(data_end))?;
    Ok(tar::Builder::new(file))
}

/// Finishes an append session: writes the trailer and truncates any stale
/// bytes left over from the previous trailer. Returns the final size.
pub(crate) fn finish(builder: tar::Builder<File>) -> std::io::Result<u64> {
    let mut file = builder.into_inner()?;
    let end = file.stream_position()?;
    file.set_len(end)?;
    file.flush()?;
    Ok(end)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    fn append_member(path: &Path, name: &str, content: &[u8]) {
        let mut builder = open_append(path).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder
            .append_data(&mut header, name, &mut &content[..])
            .unwrap();
        finish(builder).unwrap();
    }

    #[test]
    fn empty_archive_has_sentinel_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.tar");
        std::fs::write(&path, empty_archive()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), EMPTY_TAR_SIZE);
    }

    #[test]
    fn append_to_empty_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.tar");
        std::fs::write(&path, empty_archive()).unwrap();

        append_member(&path, "instances/a.dcm", b"first");
        let after_one = std::fs::metadata(&path).unwrap().len();
        assert_ne!(after_one, EMPTY_TAR_SIZE);

        append_member(&path, "instances/b.dcm", b"second");

        let mut archive = tar::Archive::new(File::open(&path).unwrap());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            names.push((name, content));
        }
        assert_eq!(
            names,
            vec![
                ("instances/a.dcm".to_string(), "first".to_string()),
                ("instances/b.dcm".to_string(), "second".to_string()),
            ]
        );
    }
}
