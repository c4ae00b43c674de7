use anyhow::Result;
use clap::Parser;
use rangeagg::partition::{plan_ranges, record_span, OffsetTable};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Print how a file would be split across ranks, without loading anything.
#[derive(Parser)]
#[command(author, version, about = "Show the record-aligned byte range of every rank")]
struct Args {
    input: PathBuf,
    #[arg(short, long, default_value_t = 1)]
    workers: usize,
}

#[derive(Serialize)]
struct PlannedRange {
    rank: usize,
    first_record: usize,
    records: usize,
    start: u64,
    end: u64,
    bytes: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let table = OffsetTable::build(&args.input)?;
    let ranges = plan_ranges(&table, args.workers)?;

    let mut planned = Vec::with_capacity(ranges.len());
    for (rank, range) in ranges.into_iter().enumerate() {
        let span = record_span(table.record_count(), args.workers, rank)?;
        planned.push(PlannedRange {
            rank,
            first_record: span.start,
            records: span.len(),
            start: range.start,
            end: range.end,
            bytes: range.len(),
        });
    }

    println!("{}", serde_json::to_string_pretty(&planned)?);
    Ok(())
}
