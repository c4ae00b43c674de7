//! Files each rank leaves behind for the combiner.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::aggregate::CountByKey;

pub const COMBINED_CLEANED: &str = "combined_cleaned_data.csv";
pub const COMBINED_AGGREGATE: &str = "combined_aggregate.json";
pub const MERGED_THROUGHPUT: &str = "merged_throughput.csv";

pub fn cleaned_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("cleaned_data_rank_{}.csv", rank))
}

pub fn aggregate_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("aggregate_rank_{}.json", rank))
}

pub fn throughput_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("records_per_second_process_{}.csv", rank))
}

pub(crate) fn open_writer(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Write the rank's rendered chunks, in order, to its cleaned-data file.
/// Returns the number of bytes written.
pub fn write_cleaned(dir: &Path, rank: usize, chunks: &[String]) -> Result<u64> {
    let path = cleaned_path(dir, rank);
    let mut out = open_writer(&path)?;
    let mut bytes = 0u64;
    for chunk in chunks {
        out.write_all(chunk.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        bytes += chunk.len() as u64;
    }
    out.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(bytes)
}

pub fn write_aggregate(dir: &Path, rank: usize, counts: &CountByKey) -> Result<()> {
    let path = aggregate_path(dir, rank);
    let mut out = open_writer(&path)?;
    serde_json::to_writer_pretty(&mut out, counts)
        .with_context(|| format!("serializing {}", path.display()))?;
    out.flush()?;
    Ok(())
}

pub fn read_aggregate(path: &Path) -> Result<CountByKey> {
    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputRow {
    #[serde(rename = "Seconds")]
    pub seconds: u64,
    #[serde(rename = "RecordsProcessed")]
    pub records_processed: u64,
}

/// `Seconds,RecordsProcessed`, one row per elapsed second of the load.
pub fn write_throughput(dir: &Path, rank: usize, per_second: &[u64]) -> Result<()> {
    let path = throughput_path(dir, rank);
    let mut wtr = csv::Writer::from_writer(open_writer(&path)?);
    for (seconds, &records_processed) in per_second.iter().enumerate() {
        wtr.serialize(ThroughputRow {
            seconds: seconds as u64,
            records_processed,
        })?;
    }
    if per_second.is_empty() {
        // keep the header so the combiner sees a valid, empty series
        wtr.write_record(["Seconds", "RecordsProcessed"])?;
    }
    wtr.flush().with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn read_throughput(path: &Path) -> Result<Vec<ThroughputRow>> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    rdr.deserialize()
        .map(|row| row.with_context(|| format!("parsing {}", path.display())))
        .collect()
}
