//! Prometheus text exposition of the queue statistics.

use std::fmt::Write;

use crate::queue::QueueSet;

/// Render the metrics page body. Increments the metrics-query counter;
/// when no stats-logging interval is configured the max watermarks are
/// zeroed as they are read, giving callers a per-scrape maximum. With an
/// interval, the periodic logger owns the resets and the watermark lines
/// carry an `interval` label instead.
pub fn render(queues: &QueueSet, header: &str) -> String {
    queues.count_metrics_query();

    let interval = queues.interval();
    let reset = interval == 0;

    let mut out = String::with_capacity(1024);
    let _ = writeln!(out, "# {header}");

    let conns = queues.connections();
    let _ = writeln!(out, "hpa_client_connections_total {}", conns.clients);
    let _ = writeln!(out, "hpa_worker_connections_total {}", conns.workers);

    for snap in queues.snapshots(reset) {
        let name = &snap.name;
        let _ = writeln!(
            out,
            "hpa_queue_all{{name=\"{name}\"}} {}",
            snap.waiting as u64 + snap.running
        );
        let _ = writeln!(out, "hpa_queue_waiting{{name=\"{name}\"}} {}", snap.waiting);
        let _ = writeln!(out, "hpa_queue_running{{name=\"{name}\"}} {}", snap.running);
        let _ = writeln!(
            out,
            "hpa_queue_success_total{{name=\"{name}\"}} {}",
            snap.success
        );
        let _ = writeln!(
            out,
            "hpa_queue_failure_total{{name=\"{name}\"}} {}",
            snap.failure
        );
        let _ = writeln!(
            out,
            "hpa_queue_disconnect_total{{name=\"{name}\"}} {}",
            snap.disconnect
        );

        let labels = if interval > 0 {
            format!("name=\"{name}\",interval=\"{interval}s\"")
        } else {
            format!("name=\"{name}\"")
        };
        let _ = writeln!(out, "hpa_queue_maxrun_seconds{{{labels}}} {}", snap.max_run);
        let _ = writeln!(
            out,
            "hpa_queue_maxwait_seconds{{{labels}}} {}",
            snap.max_wait
        );
        let _ = writeln!(
            out,
            "hpa_queue_maxtotal_seconds{{{labels}}} {}",
            snap.max_total
        );
    }

    out
}
