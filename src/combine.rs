use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{info, instrument, warn};

use crate::{
    aggregate::CountByKey,
    logging::EventLog,
    output::{
        aggregate_path, cleaned_path, open_writer, read_aggregate, read_throughput,
        throughput_path, COMBINED_AGGREGATE, COMBINED_CLEANED, MERGED_THROUGHPUT,
    },
};

/// What the coordinator managed to put together after the barrier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CombineReport {
    pub combined_path: PathBuf,
    /// Ranks whose cleaned file made it into the combined file.
    pub included: Vec<usize>,
    /// Ranks whose cleaned file could not be read in full.
    pub missing: Vec<usize>,
    pub bytes: u64,
    pub aggregate: CountByKey,
    pub missing_aggregates: Vec<usize>,
    pub missing_throughput: Vec<usize>,
}

/// Concatenate every rank's cleaned file in rank order, sum their aggregates
/// and join their throughput series.
///
/// An unreadable per-rank file is logged and left out; the rest still gets
/// combined. Only failing to create the combined files themselves is an error.
#[instrument(level = "info", skip(out_dir, log), fields(dir = %out_dir.display()))]
pub fn combine_outputs(
    out_dir: &Path,
    workers: usize,
    rank: usize,
    log: &dyn EventLog,
) -> Result<CombineReport> {
    let start = Instant::now();
    let mut report = CombineReport {
        combined_path: out_dir.join(COMBINED_CLEANED),
        ..CombineReport::default()
    };

    let mut combined = open_writer(&report.combined_path)?;
    for worker in 0..workers {
        let path = cleaned_path(out_dir, worker);
        match File::open(&path) {
            Ok(mut f) => {
                let appended = append_readable(&mut f, &mut combined)
                    .with_context(|| format!("writing {}", report.combined_path.display()))?;
                report.bytes += appended.copied;
                match appended.read_error {
                    None => report.included.push(worker),
                    Some(e) => {
                        // the part read before the failure stays in the output
                        warn!(worker, path = %path.display(), copied = appended.copied, error = %e, "cleaned file unreadable");
                        log.record(
                            &format!("Failed to read file: {} for combining.", path.display()),
                            rank,
                        );
                        report.missing.push(worker);
                    }
                }
            }
            Err(e) => {
                warn!(worker, path = %path.display(), error = %e, "cleaned file missing");
                log.record(
                    &format!("Failed to open file: {} for combining.", path.display()),
                    rank,
                );
                report.missing.push(worker);
            }
        }
    }
    combined
        .flush()
        .with_context(|| format!("flushing {}", report.combined_path.display()))?;

    for worker in 0..workers {
        let path = aggregate_path(out_dir, worker);
        match read_aggregate(&path) {
            Ok(counts) => report.aggregate.merge(counts),
            Err(e) => {
                warn!(worker, error = %e, "aggregate missing");
                log.record(
                    &format!("Failed to open file: {} for combining.", path.display()),
                    rank,
                );
                report.missing_aggregates.push(worker);
            }
        }
    }
    let agg_path = out_dir.join(COMBINED_AGGREGATE);
    let mut agg_out = open_writer(&agg_path)?;
    serde_json::to_writer_pretty(&mut agg_out, &report.aggregate)
        .with_context(|| format!("writing {}", agg_path.display()))?;
    agg_out.flush()?;

    report.missing_throughput = merge_throughput(out_dir, workers, rank, log)?;

    log.record("All processed data combined into a single file.", rank);
    info!(
        included = report.included.len(),
        missing = report.missing.len(),
        bytes = report.bytes,
        elapsed = ?start.elapsed(),
        "combined worker outputs"
    );
    Ok(report)
}

struct Appended {
    copied: u64,
    read_error: Option<io::Error>,
}

/// Copy `src` onto the end of `dst`. A read failure stops the copy and is
/// handed back; a write failure is returned as the error.
fn append_readable<R: Read, W: Write>(src: &mut R, dst: &mut W) -> io::Result<Appended> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => {
                return Ok(Appended {
                    copied,
                    read_error: None,
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Ok(Appended {
                    copied,
                    read_error: Some(e),
                })
            }
        };
        dst.write_all(&buf[..n])?;
        copied += n as u64;
    }
}

/// Outer-join the per-rank `Seconds,RecordsProcessed` files on `Seconds`.
/// Returns the ranks whose file could not be read; their column is all zeros.
pub fn merge_throughput(
    out_dir: &Path,
    workers: usize,
    rank: usize,
    log: &dyn EventLog,
) -> Result<Vec<usize>> {
    let mut by_second: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    let mut missing = Vec::new();

    for worker in 0..workers {
        let path = throughput_path(out_dir, worker);
        match read_throughput(&path) {
            Ok(rows) => {
                for row in rows {
                    by_second.entry(row.seconds).or_insert_with(|| vec![0; workers])[worker] +=
                        row.records_processed;
                }
            }
            Err(e) => {
                warn!(worker, error = %e, "throughput missing");
                log.record(
                    &format!("Failed to open file: {} for combining.", path.display()),
                    rank,
                );
                missing.push(worker);
            }
        }
    }

    let path = out_dir.join(MERGED_THROUGHPUT);
    let mut wtr = csv::Writer::from_writer(open_writer(&path)?);
    let mut header = vec!["Seconds".to_string()];
    header.extend((0..workers).map(|w| format!("RecordsProcessed-P{}", w)));
    wtr.write_record(&header)?;
    for (seconds, counts) in &by_second {
        let mut row = vec![seconds.to_string()];
        row.extend(counts.iter().map(|c| c.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush().with_context(|| format!("writing {}", path.display()))?;
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::tests::MemoryLog;
    use crate::output::{write_aggregate, write_cleaned, write_throughput};
    use std::fs;

    #[test]
    fn concatenates_in_rank_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // written out of order on purpose
        write_cleaned(dir.path(), 2, &["c\n".into()])?;
        write_cleaned(dir.path(), 0, &["a\n".into()])?;
        write_cleaned(dir.path(), 1, &["b1\n".into(), "b2\n".into()])?;
        for w in 0..3 {
            write_aggregate(dir.path(), w, &CountByKey::from_iter([(w as i64, 1), (9, 1)]))?;
            write_throughput(dir.path(), w, &[1])?;
        }
        let log = MemoryLog::default();
        let report = combine_outputs(dir.path(), 3, 0, &log)?;

        assert_eq!(fs::read_to_string(&report.combined_path)?, "a\nb1\nb2\nc\n");
        assert_eq!(report.included, vec![0, 1, 2]);
        assert!(report.missing.is_empty());
        assert_eq!(report.aggregate.get(9), 3);
        assert_eq!(report.aggregate.total(), 6);
        assert_eq!(
            log.messages_for(0),
            vec!["All processed data combined into a single file.".to_string()]
        );
        Ok(())
    }

    #[test]
    fn missing_worker_file_is_logged_and_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_cleaned(dir.path(), 0, &["a\n".into()])?;
        write_cleaned(dir.path(), 2, &["c\n".into()])?;
        write_aggregate(dir.path(), 0, &CountByKey::from_iter([(1, 1)]))?;
        let log = MemoryLog::default();
        let report = combine_outputs(dir.path(), 3, 0, &log)?;

        assert_eq!(fs::read_to_string(&report.combined_path)?, "a\nc\n");
        assert_eq!(report.missing, vec![1]);
        assert_eq!(report.missing_aggregates, vec![1, 2]);
        assert_eq!(report.missing_throughput, vec![0, 1, 2]);
        let messages = log.messages_for(0);
        assert!(messages
            .iter()
            .any(|m| m.contains("cleaned_data_rank_1.csv") && m.ends_with("for combining.")));
        Ok(())
    }

    /// Yields `data` once, then fails.
    struct BreaksAfter<'a> {
        data: &'a [u8],
    }

    impl Read for BreaksAfter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
            }
            let n = self.data.len().min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn read_failure_mid_copy_keeps_what_was_copied() -> Result<()> {
        let mut out = Vec::new();
        let appended = append_readable(&mut BreaksAfter { data: b"a,1\nb," }, &mut out)?;
        assert_eq!(appended.copied, 6);
        assert!(appended.read_error.is_some());
        assert_eq!(out, b"a,1\nb,");
        Ok(())
    }

    #[test]
    fn unreadable_worker_file_is_logged_and_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_cleaned(dir.path(), 0, &["a\n".into()])?;
        // opens fine on unix, fails on the first read
        fs::create_dir(cleaned_path(dir.path(), 1))?;
        write_cleaned(dir.path(), 2, &["c\n".into()])?;
        let log = MemoryLog::default();
        let report = combine_outputs(dir.path(), 3, 0, &log)?;

        assert_eq!(fs::read_to_string(&report.combined_path)?, "a\nc\n");
        assert_eq!(report.included, vec![0, 2]);
        assert_eq!(report.missing, vec![1]);
        assert!(log
            .messages_for(0)
            .iter()
            .any(|m| m.starts_with("Failed to") && m.contains("cleaned_data_rank_1.csv")));
        Ok(())
    }

    #[test]
    fn throughput_outer_join_fills_zeros() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_throughput(dir.path(), 0, &[10, 20, 30])?;
        write_throughput(dir.path(), 1, &[5])?;
        let log = MemoryLog::default();
        let missing = merge_throughput(dir.path(), 2, 0, &log)?;
        assert!(missing.is_empty());
        let text = fs::read_to_string(dir.path().join(MERGED_THROUGHPUT))?;
        assert_eq!(
            text,
            "Seconds,RecordsProcessed-P0,RecordsProcessed-P1\n0,10,5\n1,20,0\n2,30,0\n"
        );
        Ok(())
    }
}
