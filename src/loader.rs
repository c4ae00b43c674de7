use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    path::Path,
    time::Instant,
};
use tracing::{debug, info, instrument};

use crate::{
    error::{ParseError, SetupError},
    logging::EventLog,
    partition::WorkerRange,
    record::RecordSchema,
};

const LOAD_BUF_BYTES: usize = 1024 * 1024; // 1 MiB

/// Everything one rank pulled out of its byte range.
#[derive(Debug)]
pub struct LoadOutcome<R> {
    pub records: Vec<R>,
    /// Lines read, well-formed or not.
    pub lines: u64,
    pub skipped: u64,
    pub bytes: u64,
    /// Records parsed during each elapsed second of the load, index = second.
    pub per_second: Vec<u64>,
}

impl<R> LoadOutcome<R> {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            lines: 0,
            skipped: 0,
            bytes: 0,
            per_second: Vec::new(),
        }
    }
}

/// Reopen `path`, seek to `range.start` and parse lines until `range.end`.
///
/// A range that does not start at 0 must begin right after a `'\n'`;
/// otherwise the loader refuses the range instead of guessing where the first
/// record starts. Lines the schema rejects are logged and skipped.
#[instrument(level = "info", skip(path, schema, log), fields(start = range.start, end = range.end))]
pub fn load_range<S: RecordSchema>(
    path: &Path,
    range: WorkerRange,
    schema: &S,
    log: &dyn EventLog,
    rank: usize,
) -> Result<LoadOutcome<S::Record>> {
    let mut file = File::open(path).map_err(|source| SetupError::OpenInput {
        path: path.to_path_buf(),
        source,
    })?;
    if range.is_empty() {
        debug!(rank, "empty range, nothing to load");
        return Ok(LoadOutcome::empty());
    }

    if range.start != 0 {
        check_alignment(&mut file, range.start)
            .with_context(|| format!("rank {} checking range alignment", rank))?;
    }
    file.seek(SeekFrom::Start(range.start))
        .with_context(|| format!("seeking to byte {}", range.start))?;

    let mut reader = BufReader::with_capacity(LOAD_BUF_BYTES, file.take(range.len()));
    let mut outcome = LoadOutcome::empty();
    let mut buf = Vec::with_capacity(256);
    let mut pos = range.start;
    let started = Instant::now();

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("reading {} at byte {}", path.display(), pos))?;
        if n == 0 {
            break;
        }
        let line_start = pos;
        pos += n as u64;
        outcome.lines += 1;

        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        let parsed = std::str::from_utf8(&buf)
            .map_err(|_| ParseError::InvalidUtf8)
            .and_then(|line| schema.parse(line));

        match parsed {
            Ok(record) => {
                outcome.records.push(record);
                let sec = started.elapsed().as_secs() as usize;
                if outcome.per_second.len() <= sec {
                    outcome.per_second.resize(sec + 1, 0);
                }
                outcome.per_second[sec] += 1;
            }
            Err(e) => {
                outcome.skipped += 1;
                debug!(rank, byte = line_start, error = %e, "skipping malformed line");
                log.record(
                    &format!("Skipped malformed line at byte {}: {}", line_start, e),
                    rank,
                );
            }
        }
    }

    outcome.bytes = pos - range.start;
    info!(
        rank,
        lines = outcome.lines,
        records = outcome.records.len(),
        skipped = outcome.skipped,
        elapsed = ?started.elapsed(),
        "loaded range"
    );
    Ok(outcome)
}

fn check_alignment(file: &mut File, start: u64) -> Result<()> {
    let mut prev = [0u8; 1];
    file.seek(SeekFrom::Start(start - 1))?;
    file.read_exact(&mut prev)?;
    if prev[0] != b'\n' {
        return Err(SetupError::MisalignedRange { start }.into());
    }
    Ok(())
}
