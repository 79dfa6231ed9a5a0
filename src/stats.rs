//! Connection and traffic counters.
//!
//! Each worker owns a [`WorkerStats`] that its sessions update with atomic
//! increments. [`GlobalStats`] holds every worker's counters and sums them on
//! demand for the admin channel; nothing here is ever locked.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Sessions with a connected backend.
    current: AtomicU64,
    total: AtomicU64,
    sent: AtomicU64,
    recv: AtomicU64,
    /// Every live session, negotiating or relaying. Used to pick workers.
    sessions: AtomicU64,
    /// End-of-session broker notifications still in flight.
    notifies: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            current_connections: self.current.load(Ordering::Relaxed),
            total_connections: self.total.load(Ordering::Relaxed),
            total_sent: self.sent.load(Ordering::Relaxed),
            total_recv: self.recv.load(Ordering::Relaxed),
        }
    }

    pub fn load(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Marks one session live on this worker until the guard drops.
    pub fn session(self: &Arc<Self>) -> SessionGuard {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn pending_notifies(&self) -> u64 {
        self.notifies.load(Ordering::Relaxed)
    }

    /// Marks one broker notification in flight until the guard drops.
    pub fn notify(self: &Arc<Self>) -> NotifyGuard {
        self.notifies.fetch_add(1, Ordering::Relaxed);
        NotifyGuard {
            stats: Arc::clone(self),
        }
    }

    /// Counts a connection that reached its backend.
    pub fn connection(self: &Arc<Self>) -> ConnectionGuard {
        self.current.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
pub struct SessionGuard {
    stats: Arc<WorkerStats>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct NotifyGuard {
    stats: Arc<WorkerStats>,
}

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        self.stats.notifies.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<WorkerStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.current.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Byte counters of one session, mirrored into its worker's totals.
#[derive(Debug)]
pub struct SessionCounter {
    sent: AtomicU64,
    recv: AtomicU64,
    worker: Arc<WorkerStats>,
}

impl SessionCounter {
    pub fn new(worker: Arc<WorkerStats>) -> Self {
        Self {
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            worker,
        }
    }

    /// Client to backend.
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
        self.worker.sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Backend to client.
    pub fn add_recv(&self, n: u64) {
        self.recv.fetch_add(n, Ordering::Relaxed);
        self.worker.recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub current_connections: u64,
    pub total_connections: u64,
    pub total_sent: u64,
    pub total_recv: u64,
}

impl StatsSnapshot {
    fn merge(mut self, other: StatsSnapshot) -> Self {
        self.current_connections += other.current_connections;
        self.total_connections += other.total_connections;
        self.total_sent += other.total_sent;
        self.total_recv += other.total_recv;
        self
    }

    /// Parses the `current;total;sent;recv` line written by [`fmt::Display`].
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(';').map(|f| f.parse::<u64>().ok());
        let snapshot = StatsSnapshot {
            current_connections: fields.next()??,
            total_connections: fields.next()??,
            total_sent: fields.next()??,
            total_recv: fields.next()??,
        };
        fields.next().is_none().then_some(snapshot)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.current_connections, self.total_connections, self.total_sent, self.total_recv
        )
    }
}

/// Process wide view over all workers.
#[derive(Debug)]
pub struct GlobalStats {
    workers: Vec<Arc<WorkerStats>>,
}

impl GlobalStats {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: (0..workers).map(|_| Arc::new(WorkerStats::new())).collect(),
        }
    }

    pub fn worker(&self, index: usize) -> Option<Arc<WorkerStats>> {
        self.workers.get(index).cloned()
    }

    pub fn workers(&self) -> &[Arc<WorkerStats>] {
        &self.workers
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.workers
            .iter()
            .map(|w| w.snapshot())
            .fold(StatsSnapshot::default(), StatsSnapshot::merge)
    }

    pub fn worker_snapshots(&self) -> Vec<StatsSnapshot> {
        self.workers.iter().map(|w| w.snapshot()).collect()
    }

    /// Text answered to `INFO` (summary) or `STAT` (with one line per worker).
    pub fn report(&self, detailed: bool) -> String {
        let mut out = format!("{}\n", self.snapshot());
        if detailed {
            for (i, worker) in self.worker_snapshots().iter().enumerate() {
                out.push_str(&format!("worker{i};{worker}\n"));
            }
        }
        out
    }
}
