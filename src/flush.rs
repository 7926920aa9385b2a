//! Background snapshot writer for the in-memory backend.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
};

use mealbot_core::{LedgerError, LegacyDatabase};
use parking_lot::RwLock;

/// Pending flush signals before senders start coalescing.
pub const FLUSH_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushSignal {
    Sync,
    Shutdown,
}

/// Anything the worker can snapshot.
pub(crate) trait Snapshot: Send + Sync + 'static {
    fn snapshot(&self) -> &LegacyDatabase;
}

/// Cloneable handle used by mutations to request a flush.
#[derive(Clone)]
pub(crate) struct FlushHandle {
    signals: SyncSender<FlushSignal>,
}

impl FlushHandle {
    /// Requests a flush without blocking. A full queue already holds a flush
    /// that will observe the caller's mutation.
    pub fn request(&self) {
        match self.signals.try_send(FlushSignal::Sync) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Flush already pending, coalescing");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("Flush worker has stopped, mutation not persisted");
            }
        }
    }
}

pub(crate) struct FlushWorker {
    handle: FlushHandle,
    thread: JoinHandle<Result<(), LedgerError>>,
}

impl FlushWorker {
    pub fn spawn<S: Snapshot>(state: Arc<RwLock<S>>, target: PathBuf) -> Result<Self, LedgerError> {
        let (signals, queue) = mpsc::sync_channel(FLUSH_QUEUE_CAPACITY);
        let thread = thread::Builder::new()
            .name("mealbot-flush".to_string())
            .spawn(move || run(state, target, queue))?;

        Ok(Self {
            handle: FlushHandle { signals },
            thread,
        })
    }

    pub fn handle(&self) -> FlushHandle {
        self.handle.clone()
    }

    /// Queues a final flush and waits for the worker to finish it.
    pub fn shutdown(self) -> Result<(), LedgerError> {
        self.handle
            .signals
            .send(FlushSignal::Shutdown)
            .map_err(|_| LedgerError::Other("flush worker exited early".to_string()))?;
        drop(self.handle);

        self.thread
            .join()
            .map_err(|_| LedgerError::Other("flush worker panicked".to_string()))?
    }
}

fn run<S: Snapshot>(state: Arc<RwLock<S>>, target: PathBuf, queue: Receiver<FlushSignal>) -> Result<(), LedgerError> {
    tracing::debug!(path = %target.display(), "Flush worker started");
    let mut last = Ok(());

    while let Ok(signal) = queue.recv() {
        let mut shutdown = signal == FlushSignal::Shutdown;

        let encoded = {
            let guard = state.read();
            let mut coalesced = 0usize;
            while let Ok(extra) = queue.try_recv() {
                shutdown |= extra == FlushSignal::Shutdown;
                coalesced += 1;
            }
            if coalesced > 0 {
                tracing::trace!(coalesced, "Coalesced flush signals");
            }
            guard.snapshot().to_bytes()
        };

        last = encoded.and_then(|bytes| write_atomically(&target, &bytes));
        match &last {
            Ok(()) => tracing::debug!(path = %target.display(), "Snapshot flushed"),
            Err(e) => tracing::error!(path = %target.display(), error = %e, "Snapshot flush failed"),
        }

        if shutdown {
            break;
        }
    }

    tracing::debug!(path = %target.display(), "Flush worker stopped");
    last
}

/// Replaces `target` with `bytes` through a synced temp file in the same
/// directory, so readers see either the old or the new file.
pub fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".mealbot-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| LedgerError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        db: LegacyDatabase,
        reads: AtomicUsize,
    }

    impl Fixed {
        fn new(db: LegacyDatabase) -> Self {
            Self { db, reads: AtomicUsize::new(0) }
        }
    }

    impl Snapshot for Fixed {
        fn snapshot(&self) -> &LegacyDatabase {
            self.reads.fetch_add(1, Ordering::SeqCst);
            &self.db
        }
    }

    fn wait_for_reads(state: &RwLock<Fixed>, n: usize) {
        while state.read().reads.load(Ordering::SeqCst) < n {
            thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn sample() -> LegacyDatabase {
        LegacyDatabase {
            users: vec![mealbot_core::LegacyUser { id: 0, upn: "alice".into() }],
            receipts: vec![],
        }
    }

    #[test]
    fn test_write_atomically_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("db.json");
        std::fs::write(&target, b"old").unwrap();

        write_atomically(&target, b"new").unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp file left behind");
    }

    #[test]
    fn test_write_atomically_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nope").join("db.json");
        assert!(matches!(write_atomically(&target, b"x"), Err(LedgerError::Io(_))));
    }

    #[test]
    fn test_burst_of_signals_is_flushed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("db.json");
        let state = Arc::new(RwLock::new(Fixed::new(sample())));

        let worker = FlushWorker::spawn(state, target.clone()).unwrap();
        let handle = worker.handle();
        for _ in 0..(FLUSH_QUEUE_CAPACITY * 3) {
            handle.request();
        }
        worker.shutdown().unwrap();

        let written = LegacyDatabase::from_bytes(&std::fs::read(&target).unwrap()).unwrap();
        assert_eq!(written, sample());
    }

    #[test]
    fn test_shutdown_reports_final_flush_failure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("db.json");
        let state = Arc::new(RwLock::new(Fixed::new(sample())));

        let worker = FlushWorker::spawn(state, target).unwrap();
        assert!(worker.shutdown().is_err());
    }

    #[test]
    fn test_worker_survives_failed_flush() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("later");
        let target = parent.join("db.json");
        let state = Arc::new(RwLock::new(Fixed::new(sample())));

        let worker = FlushWorker::spawn(state.clone(), target.clone()).unwrap();
        let handle = worker.handle();

        handle.request();
        wait_for_reads(&state, 1);
        // Signals are handled in order, so the second read starts after the
        // first write has failed.
        handle.request();
        wait_for_reads(&state, 2);
        assert!(!target.exists());

        std::fs::create_dir(&parent).unwrap();
        state.write().db.users.push(mealbot_core::LegacyUser { id: 1, upn: "bob".into() });
        handle.request();
        worker.shutdown().unwrap();

        let written = LegacyDatabase::from_bytes(&std::fs::read(&target).unwrap()).unwrap();
        assert_eq!(written.users.len(), 2);
        assert_eq!(written.users[1].upn, "bob");
    }
}
