//! Optional server statistics.
//!
//! A [`ServerStats`] registry is injected at construction (or a disabled
//! default is created). Counters are atomics updated from the acceptor and
//! worker threads; when disabled, the hot paths skip the updates entirely.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Process-visible counters for one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    enabled: AtomicBool,
    accepts: AtomicU64,
    socket_errors: AtomicU64,
    workers: Mutex<Vec<Arc<WorkerStats>>>,
}

/// Counters owned by a single worker thread.
#[derive(Debug, Default)]
pub(crate) struct WorkerStats {
    requests: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    work_time_micros: AtomicU64,
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct StatsSnapshot {
    /// Connections accepted by the listener.
    pub accepts: u64,
    /// Socket errors observed by the accept loop.
    pub socket_errors: u64,
    /// Requests fully parsed across all workers.
    pub requests: u64,
    /// Bytes read off connection sockets.
    pub bytes_read: u64,
    /// Bytes written to connection sockets.
    pub bytes_written: u64,
    /// Total time workers spent driving connections.
    pub work_time: Duration,
    /// Worker threads ever started.
    pub workers: usize,
}

impl ServerStats {
    /// Creates a registry; disabled registries skip all updates.
    pub fn new(enabled: bool) -> ServerStats {
        ServerStats {
            enabled: AtomicBool::new(enabled),
            ..ServerStats::default()
        }
    }

    /// Whether counters are being updated.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turns counting on or off at runtime.
    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub(crate) fn record_accept(&self) {
        if self.enabled() {
            self.accepts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_socket_error(&self) {
        if self.enabled() {
            self.socket_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn register_worker(&self) -> Arc<WorkerStats> {
        let worker = Arc::new(WorkerStats::default());
        self.workers.lock().unwrap().push(worker.clone());
        worker
    }

    /// Copies all counters out.
    pub fn snapshot(&self) -> StatsSnapshot {
        let workers = self.workers.lock().unwrap();
        let mut snap = StatsSnapshot {
            accepts: self.accepts.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            requests: 0,
            bytes_read: 0,
            bytes_written: 0,
            work_time: Duration::ZERO,
            workers: workers.len(),
        };
        for w in workers.iter() {
            snap.requests += w.requests.load(Ordering::Relaxed);
            snap.bytes_read += w.bytes_read.load(Ordering::Relaxed);
            snap.bytes_written += w.bytes_written.load(Ordering::Relaxed);
            snap.work_time += Duration::from_micros(w.work_time_micros.load(Ordering::Relaxed));
        }
        snap
    }
}

impl WorkerStats {
    pub(crate) fn record(&self, requests: u64, bytes_read: u64, bytes_written: u64, work: Duration) {
        self.requests.fetch_add(requests, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
        self.work_time_micros
            .fetch_add(work.as_micros() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sums_workers() {
        let stats = ServerStats::new(true);
        stats.record_accept();
        stats.record_accept();
        let w1 = stats.register_worker();
        let w2 = stats.register_worker();
        w1.record(3, 100, 200, Duration::from_micros(10));
        w2.record(1, 50, 25, Duration::from_micros(5));

        let snap = stats.snapshot();
        assert_eq!(snap.accepts, 2);
        assert_eq!(snap.requests, 4);
        assert_eq!(snap.bytes_read, 150);
        assert_eq!(snap.bytes_written, 225);
        assert_eq!(snap.work_time, Duration::from_micros(15));
        assert_eq!(snap.workers, 2);
    }

    #[test]
    fn disabled_registry_ignores_accepts() {
        let stats = ServerStats::new(false);
        stats.record_accept();
        assert_eq!(stats.snapshot().accepts, 0);
    }
}
