use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, warn};

use super::{CompletionBarrier, RangeChannel};
use crate::{error::SetupError, partition::WorkerRange};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const WAIT_REPORT_EVERY: Duration = Duration::from_secs(30);
const BARRIER_PHASE: &str = "done";

// Everything the transport writes into a run directory starts with one of these.
const OWNED_PREFIXES: [&str; 6] = ["hello_", "welcome_", "range_", "abort", "barrier_", "abandoned_"];

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// `<pid>-<nanos>-<seq>`; distinct across processes and across calls within one.
fn unique_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "{}-{}-{}",
        process::id(),
        nanos,
        TOKEN_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct Welcome {
    nonce: String,
    session: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RangeMessage {
    session: String,
    range: WorkerRange,
}

/// Shared-directory transport for ranks running as separate processes.
///
/// [`FsTransport::connect`] runs a handshake before anything else:
/// the coordinator clears what earlier runs left in the directory and picks a
/// session token, every worker announces itself with a fresh nonce, and the
/// coordinator answers each nonce with the session. Ranges, the abort marker
/// and the barrier markers all carry the session, so files from another run
/// are never mistaken for this one's. Every file is written under a temporary
/// name and renamed into place, so a visible file is always complete.
#[derive(Debug, Clone)]
pub struct FsTransport {
    dir: PathBuf,
    rank: usize,
    workers: usize,
    poll: Duration,
    session: String,
}

impl FsTransport {
    pub fn connect(dir: impl Into<PathBuf>, rank: usize, workers: usize) -> Result<Self> {
        Self::connect_with_poll(dir, rank, workers, POLL_INTERVAL)
    }

    /// Blocks until the handshake with the coordinator (or, on the
    /// coordinator, with every worker) completes.
    pub fn connect_with_poll(
        dir: impl Into<PathBuf>,
        rank: usize,
        workers: usize,
        poll: Duration,
    ) -> Result<Self> {
        if rank >= workers {
            return Err(SetupError::InvalidTopology(format!(
                "rank {} out of range for {} workers",
                rank, workers
            ))
            .into());
        }
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating run dir {}", dir.display()))?;
        let mut transport = Self {
            dir,
            rank,
            workers,
            poll,
            session: String::new(),
        };
        transport.session = if rank == 0 {
            transport.open_session()?
        } else {
            transport.join_session()
        };
        debug!(rank, session = %transport.session, "joined run");
        Ok(transport)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn hello_path(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("hello_{}", rank))
    }

    fn welcome_path(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("welcome_{}.json", rank))
    }

    fn range_path(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("range_{}.json", rank))
    }

    fn abort_path(&self) -> PathBuf {
        self.dir.join("abort")
    }

    fn barrier_path(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("barrier_{}_{}", BARRIER_PHASE, rank))
    }

    fn abandoned_path(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("abandoned_{}", rank))
    }

    /// True if `path` exists and was written during this session.
    fn is_current(&self, path: &Path) -> bool {
        fs::read_to_string(path).is_ok_and(|s| s == self.session)
    }

    fn first_abandoned(&self) -> Option<usize> {
        (0..self.workers).find(|r| self.is_current(&self.abandoned_path(*r)))
    }

    /// Coordinator side: clear leftovers, then welcome every worker that says
    /// hello after the clear.
    fn open_session(&self) -> Result<String> {
        let cleared = clear_run_dir(&self.dir)?;
        if cleared > 0 {
            info!(dir = %self.dir.display(), files = cleared, "cleared files from an earlier run");
        }
        let session = unique_token();

        let mut pending: BTreeSet<usize> = (1..self.workers).collect();
        let started = Instant::now();
        let mut last_report = started;
        while !pending.is_empty() {
            let mut welcomed = Vec::new();
            for &rank in &pending {
                let Ok(nonce) = fs::read_to_string(self.hello_path(rank)) else {
                    continue;
                };
                let body = serde_json::to_vec(&Welcome {
                    nonce,
                    session: session.clone(),
                })?;
                publish(&self.welcome_path(rank), &body)
                    .with_context(|| format!("welcoming rank {}", rank))?;
                welcomed.push(rank);
            }
            for rank in welcomed {
                pending.remove(&rank);
            }
            if pending.is_empty() {
                break;
            }
            if last_report.elapsed() >= WAIT_REPORT_EVERY {
                info!(waiting_for = ?pending, waited = ?started.elapsed(), "waiting for workers to join");
                last_report = Instant::now();
            }
            thread::sleep(self.poll);
        }
        Ok(session)
    }

    /// Worker side: keep a hello with a fresh nonce in place until a welcome
    /// echoing that nonce shows up. The hello is rewritten whenever the
    /// coordinator's clear removes it.
    fn join_session(&self) -> String {
        let nonce = unique_token();
        let hello = self.hello_path(self.rank);
        let welcome = self.welcome_path(self.rank);
        let started = Instant::now();
        let mut last_report = started;
        loop {
            let accepted = fs::read(&welcome)
                .ok()
                .and_then(|body| serde_json::from_slice::<Welcome>(&body).ok())
                .filter(|w| w.nonce == nonce);
            if let Some(w) = accepted {
                return w.session;
            }
            if !hello.exists() {
                if let Err(e) = publish(&hello, nonce.as_bytes()) {
                    debug!(rank = self.rank, error = %e, "hello not written yet");
                }
            }
            if last_report.elapsed() >= WAIT_REPORT_EVERY {
                info!(rank = self.rank, waited = ?started.elapsed(), "waiting for the coordinator");
                last_report = Instant::now();
            }
            thread::sleep(self.poll);
        }
    }
}

/// Remove every transport file in `dir`. Returns how many were removed.
fn clear_run_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let owned = name
            .to_str()
            .is_some_and(|n| OWNED_PREFIXES.iter().any(|p| n.starts_with(p)));
        if owned && entry.file_type()?.is_file() {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                // a worker's temp file may already have been renamed
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("removing {}", entry.path().display()))
                }
            }
        }
    }
    Ok(removed)
}

fn publish(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

impl RangeChannel for FsTransport {
    fn send(&self, rank: usize, range: WorkerRange) -> Result<(), SetupError> {
        let failed = |reason: String| SetupError::SendFailed { rank, reason };
        let message = RangeMessage {
            session: self.session.clone(),
            range,
        };
        let body = serde_json::to_vec(&message).map_err(|e| failed(e.to_string()))?;
        publish(&self.range_path(rank), &body).map_err(|e| failed(e.to_string()))?;
        debug!(to = rank, start = range.start, end = range.end, "published range");
        Ok(())
    }

    fn receive(&self) -> Result<WorkerRange, SetupError> {
        let path = self.range_path(self.rank);
        let started = Instant::now();
        let mut last_report = started;
        loop {
            if path.exists() {
                let malformed = |reason: String| SetupError::MalformedRange {
                    rank: self.rank,
                    reason,
                };
                let body = fs::read(&path).map_err(|e| malformed(e.to_string()))?;
                let message: RangeMessage =
                    serde_json::from_slice(&body).map_err(|e| malformed(e.to_string()))?;
                if message.session == self.session {
                    let range = message.range;
                    if range.end < range.start {
                        return Err(malformed(format!(
                            "end {} before start {}",
                            range.end, range.start
                        )));
                    }
                    return Ok(range);
                }
                debug!(rank = self.rank, session = %message.session, "ignoring range from another run");
            }
            if self.is_current(&self.abort_path()) {
                return Err(SetupError::RangeNotReceived { rank: self.rank });
            }
            if last_report.elapsed() >= WAIT_REPORT_EVERY {
                info!(rank = self.rank, waited = ?started.elapsed(), "still waiting for range");
                last_report = Instant::now();
            }
            thread::sleep(self.poll);
        }
    }

    fn close(&self) {
        if let Err(e) = publish(&self.abort_path(), self.session.as_bytes()) {
            error!("writing abort marker: {}", e);
        }
    }
}

impl CompletionBarrier for FsTransport {
    fn await_all(&self, rank: usize) -> Result<(), SetupError> {
        publish(&self.barrier_path(rank), self.session.as_bytes()).map_err(|source| {
            SetupError::BarrierWrite {
                phase: BARRIER_PHASE.into(),
                rank,
                source,
            }
        })?;
        let started = Instant::now();
        let mut last_report = started;
        loop {
            if let Some(by) = self.first_abandoned() {
                return Err(SetupError::BarrierAbandoned {
                    phase: BARRIER_PHASE.into(),
                    rank: by,
                });
            }
            let done = (0..self.workers)
                .filter(|r| self.is_current(&self.barrier_path(*r)))
                .count();
            if done >= self.workers {
                debug!(rank, waited = ?started.elapsed(), "barrier passed");
                return Ok(());
            }
            if last_report.elapsed() >= WAIT_REPORT_EVERY {
                info!(rank, done, expected = self.workers, "waiting at barrier");
                last_report = Instant::now();
            }
            thread::sleep(self.poll);
        }
    }

    fn abandon(&self, rank: usize) {
        if let Err(e) = publish(&self.abandoned_path(rank), self.session.as_bytes()) {
            warn!("writing abandon marker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(5);

    /// Connect every rank of a run concurrently; returned in rank order.
    fn connect_all(dir: &Path, workers: usize) -> Vec<FsTransport> {
        let handles: Vec<_> = (0..workers)
            .map(|rank| {
                let dir = dir.to_path_buf();
                thread::spawn(move || FsTransport::connect_with_poll(dir, rank, workers, POLL))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    }

    #[test]
    fn handshake_shares_one_session() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ranks = connect_all(dir.path(), 4);
        assert!(!ranks[0].session().is_empty());
        assert!(ranks.iter().all(|t| t.session() == ranks[0].session()));
        Ok(())
    }

    #[test]
    fn range_round_trip_through_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ranks = connect_all(dir.path(), 2);
        let worker = ranks.pop().unwrap();
        let waiting = thread::spawn(move || worker.receive());
        ranks[0].send(1, WorkerRange::new(20, 41))?;
        assert_eq!(waiting.join().unwrap()?, WorkerRange::new(20, 41));
        Ok(())
    }

    #[test]
    fn rank_outside_topology_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = FsTransport::connect_with_poll(dir.path(), 5, 2, POLL).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::InvalidTopology(_))
        ));
        Ok(())
    }

    #[test]
    fn malformed_message_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ranks = connect_all(dir.path(), 2);
        fs::write(dir.path().join("range_1.json"), b"{\"start\": 5}")?;
        assert!(matches!(
            ranks[1].receive(),
            Err(SetupError::MalformedRange { rank: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn abort_marker_fails_receivers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ranks = connect_all(dir.path(), 3);
        ranks[0].close();
        assert!(matches!(
            ranks[2].receive(),
            Err(SetupError::RangeNotReceived { rank: 2 })
        ));
        Ok(())
    }

    #[test]
    fn markers_from_another_session_are_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ranks = connect_all(dir.path(), 2);
        fs::write(dir.path().join("abort"), b"some-old-session")?;
        fs::write(dir.path().join("abandoned_1"), b"some-old-session")?;
        let stale = serde_json::to_vec(&RangeMessage {
            session: "some-old-session".into(),
            range: WorkerRange::new(0, 5),
        })?;
        fs::write(dir.path().join("range_1.json"), stale)?;

        let worker = ranks.pop().unwrap();
        let waiting = thread::spawn(move || worker.receive());
        thread::sleep(Duration::from_millis(50));
        assert!(!waiting.is_finished());
        ranks[0].send(1, WorkerRange::new(20, 41))?;
        assert_eq!(waiting.join().unwrap()?, WorkerRange::new(20, 41));
        Ok(())
    }

    #[test]
    fn barrier_waits_for_every_rank() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let handles: Vec<_> = connect_all(dir.path(), 3)
            .into_iter()
            .enumerate()
            .map(|(rank, t)| thread::spawn(move || t.await_all(rank)))
            .collect();
        for h in handles {
            h.join().unwrap()?;
        }
        Ok(())
    }

    #[test]
    fn rerun_in_same_dir_waits_for_fresh_arrivals() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first: Vec<_> = connect_all(dir.path(), 2)
            .into_iter()
            .enumerate()
            .map(|(rank, t)| thread::spawn(move || t.await_all(rank)))
            .collect();
        for h in first {
            h.join().unwrap()?;
        }

        let mut second = connect_all(dir.path(), 2);
        let worker = second.pop().unwrap();
        let coordinator = second.pop().unwrap();
        let waiting = thread::spawn(move || coordinator.await_all(0));
        thread::sleep(Duration::from_millis(100));
        assert!(!waiting.is_finished(), "coordinator passed on last run's markers");
        worker.await_all(1)?;
        waiting.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn rerun_never_delivers_last_runs_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = connect_all(dir.path(), 2);
        first[0].send(1, WorkerRange::new(0, 5))?;
        assert_eq!(first[1].receive()?, WorkerRange::new(0, 5));

        let mut second = connect_all(dir.path(), 2);
        let worker = second.pop().unwrap();
        let waiting = thread::spawn(move || worker.receive());
        thread::sleep(Duration::from_millis(50));
        assert!(!waiting.is_finished());
        second[0].send(1, WorkerRange::new(7, 9))?;
        assert_eq!(waiting.join().unwrap()?, WorkerRange::new(7, 9));
        Ok(())
    }

    #[test]
    fn abandoned_rank_breaks_barrier() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ranks = connect_all(dir.path(), 2);
        ranks[1].abandon(1);
        assert!(matches!(
            ranks[0].await_all(0),
            Err(SetupError::BarrierAbandoned { rank: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn failed_arrival_write_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let solo = FsTransport::connect_with_poll(dir.path(), 0, 1, POLL)?;
        // a directory in the marker's place makes the rename fail
        fs::create_dir(dir.path().join("barrier_done_0"))?;
        assert!(matches!(
            solo.await_all(0),
            Err(SetupError::BarrierWrite { rank: 0, .. })
        ));
        Ok(())
    }
}
