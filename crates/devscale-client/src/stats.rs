//! Process-wide request/reply statistics. One mutex guards the whole
//! record; it is held briefly and never across I/O.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;

use devscale_core::proto::Reply;

/// Success/failure reply counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReplyCount {
    pub success: u64,
    pub failure: u64,
}

/// Min/max/total aggregate over successful replies. The first sample
/// initializes the minimum; `average()` divides the running total by the
/// sample count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeAggregate {
    pub min: f64,
    pub max: f64,
    pub total: f64,
    count: u64,
}

impl TimeAggregate {
    fn record(&mut self, secs: f64) {
        if self.count == 0 || secs < self.min {
            self.min = secs;
        }
        if secs > self.max {
            self.max = secs;
        }
        self.total += secs;
        self.count += 1;
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// Per-node statistics, created lazily on first observation of the node.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Successful replies per device.
    pub device: HashMap<String, u64>,
    /// Successful replies per pod.
    pub pod: HashMap<String, u64>,
    /// Failure counts per error string.
    pub error: HashMap<String, u64>,
    /// Run times of all successful replies.
    pub runtime: Vec<f64>,
    pub reply: ReplyCount,
}

#[derive(Debug)]
struct StatsInner {
    node: HashMap<String, NodeStats>,
    start: Instant,
    reply: ReplyCount,
    /// Number of in-flight requests.
    pending: u64,
    run: TimeAggregate,
    wait: TimeAggregate,
    comm: TimeAggregate,
    /// HTTP endpoint counters; never reset after startup.
    completed: u64,
    rejected: u64,
}

/// Read-only copy for rendering, taken in one lock section.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub node: HashMap<String, NodeStats>,
    pub elapsed_secs: f64,
    pub reply: ReplyCount,
    pub pending: u64,
    pub run: TimeAggregate,
    pub wait: TimeAggregate,
    pub comm: TimeAggregate,
    pub completed: u64,
    pub rejected: u64,
}

/// The client's request statistics record.
#[derive(Debug)]
pub struct ClientStats {
    inner: Mutex<StatsInner>,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                node: HashMap::new(),
                start: Instant::now(),
                reply: ReplyCount::default(),
                pending: 0,
                run: TimeAggregate::default(),
                wait: TimeAggregate::default(),
                comm: TimeAggregate::default(),
                completed: 0,
                rejected: 0,
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().expect("stats mutex poisoned")
    }

    /// Called when a request goes out: restarts the wall clock if the
    /// process was idle, and counts the request as pending.
    pub fn request_started(&self) {
        let mut inner = self.locked();
        if inner.pending == 0 && inner.reply.success == 0 && inner.reply.failure == 0 {
            debug!("stats tracking started");
            inner.start = Instant::now();
        }
        inner.pending += 1;
    }

    /// Record a successful reply; `comm` is the locally measured elapsed
    /// time minus the reported wait and run times. Node, pod and device
    /// names are escaped on the way in so they are safe in HTML output.
    pub fn record_success(&self, reply: &Reply, comm: f64) {
        let mut inner = self.locked();
        inner.pending = inner.pending.saturating_sub(1);
        inner.reply.success += 1;

        inner.run.record(reply.runtime);
        inner.wait.record(reply.wait_time);
        inner.comm.record(comm);

        let node = inner
            .node
            .entry(html_escape::encode_text(&reply.node).into_owned())
            .or_default();
        node.reply.success += 1;
        node.runtime.push(reply.runtime);
        *node
            .device
            .entry(html_escape::encode_text(&reply.device).into_owned())
            .or_default() += 1;
        *node
            .pod
            .entry(html_escape::encode_text(&reply.pod).into_owned())
            .or_default() += 1;
    }

    /// Record a failure reply. Error strings are kept verbatim; they are
    /// only escaped when rendered as HTML, since angle brackets are
    /// legitimate in error text.
    pub fn record_failure(&self, reply: &Reply) {
        let mut inner = self.locked();
        inner.pending = inner.pending.saturating_sub(1);
        inner.reply.failure += 1;

        if !reply.node.is_empty() {
            let node = inner
                .node
                .entry(html_escape::encode_text(&reply.node).into_owned())
                .or_default();
            *node.error.entry(reply.error.clone()).or_default() += 1;
            node.reply.failure += 1;
        }
    }

    /// Reset the request statistics; the HTTP endpoint counters survive.
    pub fn reset(&self) {
        let mut inner = self.locked();
        inner.pending = 0;
        inner.start = Instant::now();
        inner.node.clear();
        inner.reply = ReplyCount::default();
        inner.run = TimeAggregate::default();
        inner.wait = TimeAggregate::default();
        inner.comm = TimeAggregate::default();
    }

    pub fn http_completed(&self) {
        self.locked().completed += 1;
    }

    pub fn http_rejected(&self) {
        self.locked().rejected += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.locked();
        StatsSnapshot {
            node: inner.node.clone(),
            elapsed_secs: inner.start.elapsed().as_secs_f64(),
            reply: inner.reply,
            pending: inner.pending,
            run: inner.run,
            wait: inner.wait,
            comm: inner.comm,
            completed: inner.completed,
            rejected: inner.rejected,
        }
    }
}
