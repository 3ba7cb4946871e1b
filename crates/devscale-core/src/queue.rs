//! Per-queue pairing of waiting client requests with worker pulls.
//!
//! The queue set is fixed at startup and read without locking. Each
//! queue guards its FIFO and statistics with its own mutex; lock
//! sections never perform I/O and no two queue mutexes are ever held at
//! once.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ConfigError;
use crate::proto::Reply;

/// One admitted client request waiting for a worker.
///
/// The item exclusively owns the client connection from admission until
/// it is pruned (dropped without a reply) or handed to a dispatch
/// activity together with a worker connection.
#[derive(Debug)]
pub struct QueueItem {
    /// Where the reply goes.
    pub client: TcpStream,
    /// Admission time; dispatch time minus this is the queue wait.
    pub added: Instant,
    /// Extra workload arguments from the client request.
    pub args: Vec<String>,
    /// Client-requested run-time limit in seconds (0 = default).
    pub limit: f64,
}

impl QueueItem {
    pub fn new(client: TcpStream, args: Vec<String>, limit: f64) -> Self {
        Self {
            client,
            added: Instant::now(),
            args,
            limit,
        }
    }
}

/// Counters and watermarks for one queue, guarded by the queue mutex.
#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    running: u64,
    success: u64,
    failure: u64,
    disconnect: u64,
    max_wait: f64,
    max_run: f64,
    max_total: f64,
}

/// Copy of one queue's counters, taken under its lock so it can be
/// rendered without holding the lock across I/O.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub name: String,
    pub waiting: usize,
    pub running: u64,
    pub success: u64,
    pub failure: u64,
    pub disconnect: u64,
    pub max_wait: f64,
    pub max_run: f64,
    pub max_total: f64,
}

/// Outcome of a worker pull.
#[derive(Debug)]
pub enum Pull {
    /// Nothing left after pruning; `pruned` obsolete clients were
    /// discarded.
    Empty { pruned: usize },
    /// The queue head, with `running` already incremented.
    Item { item: QueueItem, pruned: usize },
}

/// One named FIFO of admitted requests plus its statistics.
#[derive(Debug)]
pub struct DispatchQueue {
    name: String,
    /// Maximum number of waiting items; 0 = unlimited.
    capacity: usize,
    state: Mutex<QueueState>,
}

impl DispatchQueue {
    fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn locked(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue mutex poisoned")
    }

    /// Append an item, unless the queue is at capacity. On rejection the
    /// item is handed back so the caller can reply on its connection.
    pub fn admit(&self, item: QueueItem) -> Result<(), QueueItem> {
        let mut state = self.locked();
        if self.capacity > 0 && state.items.len() >= self.capacity {
            return Err(item);
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Take the queue head for dispatch. Obsolete clients at the head are
    /// pruned first and counted as disconnects; `running` is incremented
    /// for a returned item before the lock is released.
    pub fn pull(&self) -> Pull {
        let mut state = self.locked();
        let pruned = prune_gone_clients(&mut state.items);
        state.disconnect += pruned as u64;
        match state.items.pop_front() {
            Some(item) => {
                state.running += 1;
                Pull::Item { item, pruned }
            }
            None => Pull::Empty { pruned },
        }
    }

    /// Record a finished dispatch: update the watermarks, count the
    /// outcome, and release the running slot. A reply that could not be
    /// delivered to its client counts as a failure regardless of the
    /// worker's return code.
    pub fn complete(&self, reply: &Reply, delivered: bool) {
        let mut state = self.locked();
        if reply.wait_time > state.max_wait {
            state.max_wait = reply.wait_time;
        }
        if reply.runtime > state.max_run {
            state.max_run = reply.runtime;
        }
        let total = reply.wait_time + reply.runtime;
        if total > state.max_total {
            state.max_total = total;
        }
        if reply.retcode == 0 && delivered {
            state.success += 1;
        } else {
            state.failure += 1;
        }
        state.running -= 1;
    }

    /// Copy the counters out, optionally zeroing the max watermarks so
    /// the next period starts fresh.
    pub fn snapshot(&self, reset_watermarks: bool) -> QueueSnapshot {
        let mut state = self.locked();
        let snap = QueueSnapshot {
            name: self.name.clone(),
            waiting: state.items.len(),
            running: state.running,
            success: state.success,
            failure: state.failure,
            disconnect: state.disconnect,
            max_wait: state.max_wait,
            max_run: state.max_run,
            max_total: state.max_total,
        };
        if reset_watermarks {
            state.max_wait = 0.0;
            state.max_run = 0.0;
            state.max_total = 0.0;
        }
        snap
    }
}

/// Drop the prefix of items whose client has already disconnected, so a
/// worker is never paired with work whose reply would go nowhere.
///
/// Each connection is probed with a non-blocking one-byte read: would-
/// block means the peer is still there, and the scan stops at the first
/// live client (prefix only, preserving FIFO). End-of-stream, a stray
/// payload byte, or any error means the client is gone; dropping the
/// item closes its connection. Returns the number of items discarded.
fn prune_gone_clients(items: &mut VecDeque<QueueItem>) -> usize {
    let mut gone = 0;
    for item in items.iter() {
        let mut buf = [0u8; 1];
        match item.client.try_read(&mut buf) {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            _ => gone += 1,
        }
    }
    if gone > 0 {
        debug!(count = gone, "pruning disconnected clients");
        items.drain(..gone);
    }
    gone
}

/// Process-wide connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionCounts {
    pub clients: u64,
    pub workers: u64,
    pub metrics: u64,
}

/// The startup-fixed set of named queues plus the connection counters.
/// The name set never changes after construction.
#[derive(Debug)]
pub struct QueueSet {
    queues: HashMap<String, Arc<DispatchQueue>>,
    qmax: usize,
    /// Stats-logging interval in seconds; 0 = disabled, which makes the
    /// metrics exporter reset the watermarks on each scrape instead.
    interval: u64,
    clients: AtomicU64,
    workers: AtomicU64,
    metrics: AtomicU64,
}

impl QueueSet {
    pub fn new(names: &[String], qmax: usize, interval: u64) -> Result<Self, ConfigError> {
        if names.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        let mut queues = HashMap::with_capacity(names.len());
        for name in names {
            if name.is_empty() {
                return Err(ConfigError::EmptyQueueName);
            }
            queues.insert(
                name.clone(),
                Arc::new(DispatchQueue::new(name.clone(), qmax)),
            );
        }
        Ok(Self {
            queues,
            qmax,
            interval,
            clients: AtomicU64::new(0),
            workers: AtomicU64::new(0),
            metrics: AtomicU64::new(0),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<DispatchQueue>> {
        self.queues.get(name).cloned()
    }

    pub fn qmax(&self) -> usize {
        self.qmax
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Queue names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Snapshots of every queue in name order.
    pub fn snapshots(&self, reset_watermarks: bool) -> Vec<QueueSnapshot> {
        self.names()
            .into_iter()
            .map(|name| self.queues[name].snapshot(reset_watermarks))
            .collect()
    }

    pub fn count_client(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_worker(&self) {
        self.workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_metrics_query(&self) {
        self.metrics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> ConnectionCounts {
        ConnectionCounts {
            clients: self.clients.load(Ordering::Relaxed),
            workers: self.workers.load(Ordering::Relaxed),
            metrics: self.metrics.load(Ordering::Relaxed),
        }
    }
}
