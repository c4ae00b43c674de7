use memchr::memchr_iter;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::Path,
    time::Instant,
};
use tracing::{debug, info, instrument};

use crate::error::SetupError;

const READ_BUF_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// Byte offset of every record start in a file, followed by a sentinel equal
/// to the file length. Always holds `record_count() + 1` strictly increasing
/// entries starting at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetTable {
    offsets: Vec<u64>,
}

impl OffsetTable {
    /// Scan `path` once and record where each `'\n'`-terminated line begins.
    #[instrument(level = "info", skip(path), fields(path = %path.as_ref().display()))]
    pub fn build<P: AsRef<Path>>(path: P) -> Result<Self, SetupError> {
        let start = Instant::now();
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SetupError::OpenInput {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_reader(file).map_err(|source| SetupError::ReadInput {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            records = table.record_count(),
            bytes = table.file_len(),
            elapsed = ?start.elapsed(),
            "built offset table"
        );
        Ok(table)
    }

    /// Same as [`OffsetTable::build`] over any byte stream.
    pub fn from_reader<R: Read>(reader: R) -> io::Result<Self> {
        let mut reader = BufReader::with_capacity(READ_BUF_BYTES, reader);
        let mut offsets = vec![0u64];
        let mut pos: u64 = 0;

        loop {
            let buf = match reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if buf.is_empty() {
                break;
            }
            offsets.extend(memchr_iter(b'\n', buf).map(|nl| pos + nl as u64 + 1));
            let n = buf.len();
            pos += n as u64;
            reader.consume(n);
        }

        // A trailing terminator already produced the sentinel; an unterminated
        // last line still counts as a record.
        if offsets.last().copied() != Some(pos) {
            offsets.push(pos);
        }
        debug!(entries = offsets.len(), "scanned record boundaries");
        Ok(Self { offsets })
    }

    pub fn record_count(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn file_len(&self) -> u64 {
        self.offsets[self.offsets.len() - 1]
    }

    /// Start offset of record `idx`; `idx == record_count()` yields the file length.
    pub fn offset(&self, idx: usize) -> u64 {
        self.offsets[idx]
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }
}
