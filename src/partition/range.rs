use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::offsets::OffsetTable;
use crate::error::SetupError;

/// Half-open byte range `[start, end)` owned by one rank. Both ends sit on
/// record boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRange {
    pub start: u64,
    pub end: u64,
}

impl WorkerRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Record indices owned by `rank` when `total` records are split across
/// `workers`. The first `total % workers` ranks take one extra record.
pub fn record_span(total: usize, workers: usize, rank: usize) -> Result<Range<usize>, SetupError> {
    if workers == 0 {
        return Err(SetupError::InvalidTopology("worker count must be at least 1".into()));
    }
    if rank >= workers {
        return Err(SetupError::InvalidTopology(format!(
            "rank {rank} outside 0..{workers}"
        )));
    }
    let base = total / workers;
    let remainder = total % workers;
    let start = rank * base + rank.min(remainder);
    let end = (rank + 1) * base + (rank + 1).min(remainder);
    Ok(start..end)
}

/// Byte range for a single rank, ending at the start of the first record it
/// does not own (or at the file length for the last rank).
pub fn range_for_rank(
    table: &OffsetTable,
    workers: usize,
    rank: usize,
) -> Result<WorkerRange, SetupError> {
    let span = record_span(table.record_count(), workers, rank)?;
    Ok(WorkerRange::new(table.offset(span.start), table.offset(span.end)))
}

/// Every rank's range, in rank order.
pub fn plan_ranges(table: &OffsetTable, workers: usize) -> Result<Vec<WorkerRange>, SetupError> {
    (0..workers)
        .map(|rank| range_for_rank(table, workers, rank))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn table(content: &str) -> OffsetTable {
        OffsetTable::from_reader(Cursor::new(content.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn spans_cover_every_record_once() {
        for total in 0..60 {
            for workers in 1..13 {
                let spans: Vec<_> = (0..workers)
                    .map(|r| record_span(total, workers, r).unwrap())
                    .collect();
                assert_eq!(spans[0].start, 0);
                assert_eq!(spans[workers - 1].end, total);
                for pair in spans.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start, "gap at total={total} workers={workers}");
                }
                let sizes: Vec<usize> = spans.iter().map(|s| s.len()).collect();
                let min = *sizes.iter().min().unwrap();
                let max = *sizes.iter().max().unwrap();
                assert!(max - min <= 1, "unbalanced {sizes:?}");
            }
        }
    }

    #[test]
    fn remainder_goes_to_lowest_ranks() {
        let spans: Vec<_> = (0..3).map(|r| record_span(10, 3, r).unwrap()).collect();
        assert_eq!(spans, vec![0..4, 4..7, 7..10]);
    }

    #[test]
    fn two_records_two_workers() {
        let t = table("1,2000,01/01/2020,5\n2,1999,02/02/2020,12\n");
        let ranges = plan_ranges(&t, 2).unwrap();
        assert_eq!(ranges, vec![WorkerRange::new(0, 20), WorkerRange::new(20, 41)]);
    }

    #[test]
    fn byte_ranges_are_contiguous_and_aligned() {
        let content: String = (0..37).map(|i| format!("{i},{}\n", "y".repeat(i % 7))).collect();
        let t = table(&content);
        for workers in 1..9 {
            let ranges = plan_ranges(&t, workers).unwrap();
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[workers - 1].end, t.file_len());
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            for r in &ranges {
                assert!(t.offsets().contains(&r.start));
                assert!(t.offsets().contains(&r.end));
            }
        }
    }

    #[test]
    fn single_worker_owns_whole_file() {
        let t = table("a\nb\nc");
        assert_eq!(plan_ranges(&t, 1).unwrap(), vec![WorkerRange::new(0, 5)]);
    }

    #[test]
    fn more_workers_than_records_leaves_empty_tail() {
        let t = table("a\nb\n");
        let ranges = plan_ranges(&t, 4).unwrap();
        assert_eq!(ranges[0], WorkerRange::new(0, 2));
        assert_eq!(ranges[1], WorkerRange::new(2, 4));
        assert!(ranges[2].is_empty() && ranges[3].is_empty());
        assert_eq!(ranges[3].end, 4);
    }

    #[test]
    fn rejects_bad_topology() {
        assert!(matches!(record_span(5, 0, 0), Err(SetupError::InvalidTopology(_))));
        assert!(matches!(record_span(5, 2, 2), Err(SetupError::InvalidTopology(_))));
    }
}
