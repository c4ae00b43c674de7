use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::debug;

use super::{CompletionBarrier, RangeChannel};
use crate::{error::SetupError, partition::WorkerRange};

/// In-process wiring for ranks that run as threads of one process.
pub struct LocalFabric;

impl LocalFabric {
    /// One endpoint per rank plus a barrier shared by all of them. Only the
    /// rank 0 endpoint can send; once it is dropped or closed, every
    /// undelivered `receive` fails.
    pub fn connect(workers: usize) -> (Vec<LocalEndpoint>, Arc<LocalBarrier>) {
        let (senders, receivers): (Vec<Sender<WorkerRange>>, Vec<Receiver<WorkerRange>>) =
            (0..workers).map(|_| bounded(1)).unzip();

        let mut outbox = Some(senders);
        let endpoints = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalEndpoint {
                rank,
                outbox: Mutex::new(if rank == 0 {
                    outbox.take().unwrap_or_default()
                } else {
                    Vec::new()
                }),
                inbox,
            })
            .collect();
        (endpoints, Arc::new(LocalBarrier::new("done", workers)))
    }
}

pub struct LocalEndpoint {
    rank: usize,
    outbox: Mutex<Vec<Sender<WorkerRange>>>,
    inbox: Receiver<WorkerRange>,
}

impl LocalEndpoint {
    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl RangeChannel for LocalEndpoint {
    fn send(&self, rank: usize, range: WorkerRange) -> Result<(), SetupError> {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = outbox.get(rank).ok_or_else(|| SetupError::SendFailed {
            rank,
            reason: format!("rank {} holds no sender for it", self.rank),
        })?;
        tx.send(range).map_err(|_| SetupError::SendFailed {
            rank,
            reason: "receiver dropped".into(),
        })?;
        debug!(to = rank, start = range.start, end = range.end, "sent range");
        Ok(())
    }

    fn receive(&self) -> Result<WorkerRange, SetupError> {
        self.inbox
            .recv()
            .map_err(|_| SetupError::RangeNotReceived { rank: self.rank })
    }

    fn close(&self) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    abandoned_by: Option<usize>,
}

/// Counting barrier that can be abandoned by a failed rank.
pub struct LocalBarrier {
    phase: String,
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl LocalBarrier {
    pub fn new(phase: impl Into<String>, parties: usize) -> Self {
        Self {
            phase: phase.into(),
            parties,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn abandoned(&self, by: usize) -> SetupError {
        SetupError::BarrierAbandoned {
            phase: self.phase.clone(),
            rank: by,
        }
    }
}

impl CompletionBarrier for LocalBarrier {
    fn await_all(&self, rank: usize) -> Result<(), SetupError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(by) = state.abandoned_by {
            return Err(self.abandoned(by));
        }
        state.arrived += 1;
        debug!(rank, arrived = state.arrived, parties = self.parties, "barrier arrival");
        if state.arrived >= self.parties {
            self.cvar.notify_all();
            return Ok(());
        }
        let state = self
            .cvar
            .wait_while(state, |s| s.arrived < self.parties && s.abandoned_by.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match state.abandoned_by {
            Some(by) if state.arrived < self.parties => Err(self.abandoned(by)),
            _ => Ok(()),
        }
    }

    fn abandon(&self, rank: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.abandoned_by.get_or_insert(rank);
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn scatter_delivers_one_range_per_rank() {
        let (endpoints, _) = LocalFabric::connect(3);
        let ranges = [
            WorkerRange::new(0, 10),
            WorkerRange::new(10, 25),
            WorkerRange::new(25, 30),
        ];
        for (rank, r) in ranges.iter().enumerate().skip(1) {
            endpoints[0].send(rank, *r).unwrap();
        }
        assert_eq!(endpoints[1].receive().unwrap(), ranges[1]);
        assert_eq!(endpoints[2].receive().unwrap(), ranges[2]);
    }

    #[test]
    fn workers_cannot_send() {
        let (endpoints, _) = LocalFabric::connect(2);
        assert!(matches!(
            endpoints[1].send(0, WorkerRange::new(0, 1)),
            Err(SetupError::SendFailed { .. })
        ));
    }

    #[test]
    fn closed_coordinator_fails_pending_receivers() {
        let (mut endpoints, _) = LocalFabric::connect(2);
        let worker = endpoints.pop().unwrap();
        let handle = thread::spawn(move || worker.receive());
        endpoints[0].close();
        let res = handle.join().unwrap();
        assert!(matches!(res, Err(SetupError::RangeNotReceived { rank: 1 })));
    }

    #[test]
    fn dropped_coordinator_fails_receivers() {
        let (mut endpoints, _) = LocalFabric::connect(2);
        let worker = endpoints.pop().unwrap();
        drop(endpoints);
        assert!(worker.receive().is_err());
    }

    #[test]
    fn barrier_releases_when_all_arrive() {
        let barrier = Arc::new(LocalBarrier::new("done", 4));
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let b = Arc::clone(&barrier);
                thread::spawn(move || b.await_all(rank))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
    }

    #[test]
    fn abandoned_barrier_releases_waiters_with_error() {
        let barrier = Arc::new(LocalBarrier::new("done", 3));
        let waiter = {
            let b = Arc::clone(&barrier);
            thread::spawn(move || b.await_all(0))
        };
        barrier.abandon(2);
        let res = waiter.join().unwrap();
        assert!(matches!(res, Err(SetupError::BarrierAbandoned { rank: 2, .. })));
        assert!(barrier.await_all(1).is_err());
    }
}
