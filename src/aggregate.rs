use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Instant};
use tracing::{debug, info, instrument};

use crate::record::RecordSchema;

/// Count of records per aggregation key. Ordered so that output and
/// comparisons are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountByKey(BTreeMap<i64, u64>);

impl CountByKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: i64) {
        *self.0.entry(key).or_insert(0) += 1;
    }

    /// Sum `other` into `self`, key by key.
    pub fn merge(&mut self, other: CountByKey) {
        for (key, count) in other.0 {
            *self.0.entry(key).or_insert(0) += count;
        }
    }

    pub fn get(&self, key: i64) -> u64 {
        self.0.get(&key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of records counted.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(i64, u64)> for CountByKey {
    fn from_iter<I: IntoIterator<Item = (i64, u64)>>(iter: I) -> Self {
        let mut out = CountByKey::new();
        for (key, count) in iter {
            *out.0.entry(key).or_insert(0) += count;
        }
        out
    }
}

/// Fold any number of partial counts into one.
pub fn merge_partials<I: IntoIterator<Item = CountByKey>>(partials: I) -> CountByKey {
    partials.into_iter().fold(CountByKey::new(), |mut acc, p| {
        acc.merge(p);
        acc
    })
}

/// The slot one thread owns for the duration of the parallel region.
#[derive(Debug, Default)]
pub struct LocalAggregate {
    pub counts: CountByKey,
    /// Rendered retained records of this thread's chunk, in input order.
    pub rendered: String,
    pub records: u64,
}

/// A rank's merged result.
#[derive(Debug, Default)]
pub struct ProcessAggregate {
    pub counts: CountByKey,
    /// One rendered buffer per chunk, in chunk order.
    pub cleaned: Vec<String>,
    pub records: u64,
}

/// Count `records` by key on a pool of `threads` threads.
///
/// The index range is cut into at most `threads` contiguous chunks. Slot `i`
/// of a vector allocated up front belongs to chunk `i` alone, so the hot loop
/// takes no locks; the slots are merged once every chunk is done.
#[instrument(level = "info", skip(records, schema), fields(records = records.len()))]
pub fn aggregate_parallel<S: RecordSchema>(
    records: &[S::Record],
    threads: usize,
    schema: &S,
) -> Result<ProcessAggregate> {
    let start = Instant::now();
    let threads = threads.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("aggregate-{}", i))
        .build()
        .context("building aggregation thread pool")?;

    let chunk_len = records.len().div_ceil(threads).max(1);
    let mut slots: Vec<LocalAggregate> = (0..threads).map(|_| LocalAggregate::default()).collect();

    pool.install(|| {
        slots
            .par_iter_mut()
            .zip(records.par_chunks(chunk_len))
            .for_each(|(slot, chunk)| {
                for record in chunk {
                    slot.counts.add(schema.key(record));
                    schema.render(record, &mut slot.rendered);
                }
                slot.records = chunk.len() as u64;
            });
    });

    let mut merged = ProcessAggregate {
        cleaned: Vec::with_capacity(slots.len()),
        ..ProcessAggregate::default()
    };
    for (idx, slot) in slots.into_iter().enumerate() {
        debug!(slot = idx, records = slot.records, keys = slot.counts.len(), "merging slot");
        merged.records += slot.records;
        merged.counts.merge(slot.counts);
        if !slot.rendered.is_empty() {
            merged.cleaned.push(slot.rendered);
        }
    }

    info!(
        threads,
        keys = merged.counts.len(),
        records = merged.records,
        elapsed = ?start.elapsed(),
        "aggregated"
    );
    Ok(merged)
}
