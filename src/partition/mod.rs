// src/partition/mod.rs
pub mod offsets;
pub mod range;

pub use offsets::OffsetTable;
pub use range::{plan_ranges, range_for_rank, record_span, WorkerRange};
