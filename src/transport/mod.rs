// src/transport/mod.rs
//! How ranges reach their ranks and how ranks wait for each other.

pub mod fs;
pub mod local;

pub use fs::FsTransport;
pub use local::{LocalBarrier, LocalEndpoint, LocalFabric};

use crate::{error::SetupError, partition::WorkerRange};

/// Point-to-point delivery of one [`WorkerRange`] per rank.
pub trait RangeChannel: Send + Sync {
    /// Deliver `range` to `rank`. Only the coordinator sends.
    fn send(&self, rank: usize, range: WorkerRange) -> Result<(), SetupError>;

    /// Block until this endpoint's range arrives. Fails if the sender side
    /// went away or aborted without delivering.
    fn receive(&self) -> Result<WorkerRange, SetupError>;

    /// The coordinator failed; any rank still waiting in `receive` must fail.
    fn close(&self);
}

/// The single rendezvous after every rank wrote its partial output.
///
/// There is no timeout: a rank that never arrives and never abandons keeps
/// everyone waiting.
pub trait CompletionBarrier: Send + Sync {
    fn await_all(&self, rank: usize) -> Result<(), SetupError>;

    /// Mark the barrier unreachable because `rank` failed fatally.
    fn abandon(&self, rank: usize);
}
