//! Random-access index over a series tar: a small sqlite database mapping
//! member path to the byte range of its content, rebuilt by a single scan
//! over the tar headers. Readers use it to reach one instance without
//! walking the whole archive.

use crate::error::Error;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Rebuilds the index from scratch. Any existing index file is removed
/// first; a stale index is worse than none.
pub fn build(tar_path: &Path, index_path: &Path) -> Result<usize, Error> {
    if index_path.exists() {
        std::fs::remove_file(index_path)?;
    }
    let mut conn = Connection::open(index_path)?;
    conn.execute_batch(
        "CREATE TABLE files (
            path   TEXT PRIMARY KEY,
            offset INTEGER NOT NULL,
            size   INTEGER NOT NULL
        );",
    )?;

    let mut count = 0usize;
    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare("INSERT INTO files (path, offset, size) VALUES (?, ?, ?)")?;
        let mut archive = tar::Archive::new(File::open(tar_path)?);
        for entry in archive.entries()? {
            let entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            insert.execute(params![
                normalize(&path),
                entry.raw_file_position() as i64,
                entry.size() as i64,
            ])?;
            count += 1;
        }
    }
    tx.commit()?;
    tracing::debug!(tar = %tar_path.display(), members = count, "rebuilt tar index");
    Ok(count)
}

/// Looks up a member's content byte range as `(offset, size)`.
pub fn lookup(index_path: &Path, member: &str) -> Result<Option<(u64, u64)>, Error> {
    let conn = Connection::open(index_path)?;
    let row = conn
        .query_row(
            "SELECT offset, size FROM files WHERE path = ?",
            params![normalize(member)],
            |row| {
                let offset: i64 = row.get(0)?;
                let size: i64 = row.get(1)?;
                Ok((offset as u64, size as u64))
            },
        )
        .optional()?;
    Ok(row)
}

/// Member paths are stored without a leading slash so lookups are stable
/// across tar writers.
fn normalize(member: &str) -> &str {
    member.trim_start_matches('/')
}

/// A bounded reader over `[start, stop)` of an opened tar file.
#[derive(Debug)]
pub struct TarSlice {
    file: File,
    start: u64,
    stop: u64,
    pos: u64,
}

impl TarSlice {
    pub fn open(tar_path: &Path, start: u64, stop: u64) -> std::io::Result<Self> {
        let mut file = File::open(tar_path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(TarSlice {
            file,
            start,
            stop,
            pos: start,
        })
    }

    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }
}

impl Read for TarSlice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = (self.stop - self.pos) as usize;
        if remaining == 0 {
            return Ok(0);
        }
        let take = remaining.min(buf.len());
        let n = self.file.read(&mut buf[..take])?;
        self.pos += n as u64;
        Ok(n)
    }
}
