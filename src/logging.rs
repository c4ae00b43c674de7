use crossbeam_channel::{unbounded, Sender};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// Per-worker narrative log. Implementations must not block the caller and
/// must never surface a write failure to it.
pub trait EventLog: Send + Sync {
    fn record(&self, message: &str, worker: usize);
}

/// Appends each message to `log_process_<rank>.txt` under a directory.
///
/// Messages are queued to a single writer thread; dropping the log drains the
/// queue and joins the thread.
pub struct FileEventLog {
    tx: Option<Sender<(usize, String)>>,
    writer: Option<JoinHandle<()>>,
}

impl FileEventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let (tx, rx) = unbounded::<(usize, String)>();
        let writer = thread::Builder::new()
            .name("event-log".into())
            .spawn(move || {
                let mut files: HashMap<usize, File> = HashMap::new();
                for (worker, message) in rx {
                    write_line(&dir, &mut files, worker, &message);
                }
            });
        match writer {
            Ok(handle) => Self {
                tx: Some(tx),
                writer: Some(handle),
            },
            Err(e) => {
                eprintln!("failed to start event log writer: {}", e);
                Self {
                    tx: None,
                    writer: None,
                }
            }
        }
    }

    pub fn path_for(dir: &Path, worker: usize) -> PathBuf {
        dir.join(format!("log_process_{}.txt", worker))
    }
}

fn write_line(dir: &Path, files: &mut HashMap<usize, File>, worker: usize, message: &str) {
    if !files.contains_key(&worker) {
        let path = FileEventLog::path_for(dir, worker);
        let opened = fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(f) => {
                files.insert(worker, f);
            }
            Err(_) => {
                eprintln!("Failed to open log file for process {}", worker);
                return;
            }
        }
    }
    if let Some(f) = files.get_mut(&worker) {
        if let Err(e) = writeln!(f, "{}", message) {
            eprintln!("Failed to write log for process {}: {}", worker, e);
        }
    }
}

impl EventLog for FileEventLog {
    fn record(&self, message: &str, worker: usize) {
        debug!(worker, "{}", message);
        if let Some(tx) = &self.tx {
            // only fails once the writer is gone; nothing left to do then
            let _ = tx.send((worker, message.to_string()));
        }
    }
}

impl Drop for FileEventLog {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

/// Install the process-wide `tracing` subscriber. `RUST_LOG` overrides
/// `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .try_init();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_subscriber::FmtSubscriber;

    pub(crate) fn init_test_logging() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,rangeagg=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    /// Keeps every message in memory.
    #[derive(Default)]
    pub(crate) struct MemoryLog {
        pub(crate) lines: Mutex<Vec<(usize, String)>>,
    }

    impl MemoryLog {
        pub(crate) fn messages_for(&self, worker: usize) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter(|(w, _)| *w == worker)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    impl EventLog for MemoryLog {
        fn record(&self, message: &str, worker: usize) {
            self.lines.lock().unwrap().push((worker, message.to_string()));
        }
    }

    #[test]
    fn appends_per_worker_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let log = FileEventLog::new(dir.path());
            log.record("Worker initialized.", 0);
            log.record("Worker initialized.", 1);
            log.record("Finalizing worker.", 0);
        }
        let zero = fs::read_to_string(FileEventLog::path_for(dir.path(), 0))?;
        let one = fs::read_to_string(FileEventLog::path_for(dir.path(), 1))?;
        assert_eq!(zero, "Worker initialized.\nFinalizing worker.\n");
        assert_eq!(one, "Worker initialized.\n");
        Ok(())
    }

    #[test]
    fn unwritable_directory_is_swallowed() -> anyhow::Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        // a regular file cannot hold log files
        let log = FileEventLog::new(tmp.path().join("nested"));
        log.record("dropped", 3);
        drop(log);
        Ok(())
    }
}
