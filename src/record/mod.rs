// src/record/mod.rs
pub mod pruned;
pub mod vehicle;

pub use pruned::{PrunedRecord, PrunedSchema};
pub use vehicle::{VehicleRecord, VehicleSchema};

use crate::error::ParseError;

/// Turns one line into a typed record and describes how that record is
/// counted and written back out.
///
/// `parse` must either return a complete record or an error; a rejected line
/// is skipped by the loader and never produces a partial record.
pub trait RecordSchema: Send + Sync {
    type Record: Send + Sync;

    fn parse(&self, line: &str) -> Result<Self::Record, ParseError>;

    /// Aggregation key (e.g. vehicle age).
    fn key(&self, record: &Self::Record) -> i64;

    /// How the key reads in the per-worker log.
    fn key_label(&self) -> &str {
        "Key"
    }

    /// Append the retained fields of `record` to `out`, terminated by `'\n'`.
    fn render(&self, record: &Self::Record, out: &mut String);
}

/// Parse `fields[column]` as an integer, surrounding whitespace allowed.
pub(crate) fn parse_int<T: std::str::FromStr>(fields: &[&str], column: usize) -> Result<T, ParseError> {
    let raw = fields.get(column).copied().unwrap_or_default();
    raw.trim().parse::<T>().map_err(|_| ParseError::NotNumeric {
        column,
        value: raw.to_string(),
    })
}

/// Drop a trailing carriage return left by CRLF input.
pub(crate) fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}
