use std::path::PathBuf;
use thiserror::Error;

/// Failures that leave a rank without a usable partition. Any of these aborts
/// the rank that hit it; there is no degraded mode for a missing range.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot open input {path:?} for boundary indexing")]
    OpenInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed reading input {path:?} while indexing")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rank {rank} never received its range")]
    RangeNotReceived { rank: usize },

    #[error("could not deliver range to rank {rank}: {reason}")]
    SendFailed { rank: usize, reason: String },

    #[error("rank {rank} received a malformed range: {reason}")]
    MalformedRange { rank: usize, reason: String },

    #[error("range starting at byte {start} is not aligned to a record boundary")]
    MisalignedRange { start: u64 },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("barrier {phase} abandoned by rank {rank}")]
    BarrierAbandoned { phase: String, rank: usize },

    #[error("rank {rank} could not mark its arrival at barrier {phase}")]
    BarrierWrite {
        phase: String,
        rank: usize,
        #[source]
        source: std::io::Error,
    },
}

/// A single line that could not become a record. The line is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected at least {expected} fields, found {found}")]
    TooFewFields { expected: usize, found: usize },

    #[error("field {column} is not numeric: {value:?}")]
    NotNumeric { column: usize, value: String },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}
