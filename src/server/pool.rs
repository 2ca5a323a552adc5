use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::server::conn::Connection;
use crate::stats::ServerStats;

enum Work {
    Conn(Box<Connection>),
    Shutdown,
}

/// A pool of worker threads consuming a FIFO queue of connections.
///
/// The pool starts with `max(min, 1)` workers and grows one thread at a
/// time when a connection arrives and no worker is idle, up to `max`
/// (negative = unbounded). Each worker owns one connection at a time:
/// drive it, close it, take the next.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    tx: Sender<Work>,
    rx: Receiver<Work>,
    min: usize,
    max: isize,
    alive: Arc<AtomicUsize>,
    idle: Arc<AtomicUsize>,
    spawned: AtomicUsize,
    stats: Arc<ServerStats>,
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Conn(_) => f.write_str("Work::Conn"),
            Work::Shutdown => f.write_str("Work::Shutdown"),
        }
    }
}

impl WorkerPool {
    pub(crate) fn new(min: usize, max: isize, stats: Arc<ServerStats>) -> WorkerPool {
        let (tx, rx) = unbounded();
        WorkerPool {
            tx,
            rx,
            min: std::cmp::max(min, 1),
            max,
            alive: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
            stats,
        }
    }

    /// Brings the pool up to its minimum size.
    pub(crate) fn start(&self) {
        while self.alive.load(Ordering::SeqCst) < self.min {
            self.spawn_worker();
        }
    }

    /// Queues a connection, growing the pool first when every worker is
    /// busy and the cap allows another.
    pub(crate) fn put(&self, conn: Connection) {
        if self.idle() == 0 && self.can_grow() {
            self.spawn_worker();
        }
        let _ = self.tx.send(Work::Conn(Box::new(conn)));
    }

    fn can_grow(&self) -> bool {
        self.max < 0 || self.alive() < self.max as usize
    }

    pub(crate) fn idle(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub(crate) fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self) {
        let rx = self.rx.clone();
        let alive = self.alive.clone();
        let idle = self.idle.clone();
        let worker_stats = self.stats.register_worker();
        let stats = self.stats.clone();
        let id = self.spawned.fetch_add(1, Ordering::SeqCst);

        alive.fetch_add(1, Ordering::SeqCst);
        idle.fetch_add(1, Ordering::SeqCst);

        let thread_alive = alive.clone();
        let thread_idle = idle.clone();
        let spawned = thread::Builder::new()
            .name(format!("hearth-worker-{}", id))
            .spawn(move || {
                let alive = thread_alive;
                let idle = thread_idle;
                debug!("worker up");
                loop {
                    match rx.recv() {
                        Ok(Work::Conn(mut conn)) => {
                            idle.fetch_sub(1, Ordering::SeqCst);
                            let started = Instant::now();
                            conn.communicate();
                            let requests = conn.requests_seen;
                            let bytes_read = conn.io.bytes_read();
                            let bytes_written = conn.io.bytes_written();
                            conn.close();
                            if stats.enabled() {
                                worker_stats.record(
                                    requests,
                                    bytes_read,
                                    bytes_written,
                                    started.elapsed(),
                                );
                            }
                            idle.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(Work::Shutdown) | Err(_) => break,
                    }
                }
                idle.fetch_sub(1, Ordering::SeqCst);
                alive.fetch_sub(1, Ordering::SeqCst);
                debug!("worker down");
            });

        if let Err(e) = spawned {
            idle.fetch_sub(1, Ordering::SeqCst);
            alive.fetch_sub(1, Ordering::SeqCst);
            error!("failed to spawn worker thread: {}", e);
        }
    }

    /// Asks every worker to exit after its current connection and waits
    /// up to `grace` for them to do so. Workers still wedged past the
    /// deadline are abandoned rather than joined.
    pub(crate) fn stop(&self, grace: Duration) {
        let workers = self.alive.load(Ordering::SeqCst);
        for _ in 0..workers {
            let _ = self.tx.send(Work::Shutdown);
        }

        let deadline = Instant::now() + grace;
        while self.alive.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        let leftover = self.alive.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!("{} worker(s) still busy after {:?} grace", leftover, grace);
        }
    }
}
