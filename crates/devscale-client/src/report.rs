//! Text and HTML rendering of the request statistics: histograms per
//! node/device/pod, error lists and the overall summary.

use std::collections::HashMap;
use std::fmt::Write;

use crate::stats::{StatsSnapshot, TimeAggregate};

/// Histogram bars scale to this many columns.
const MAX_COLS: u64 = 60;

/// Where the report ends up; HTML output escapes error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Plain,
    Html,
}

fn title(out: &mut String, text: &str) {
    let _ = write!(out, "\n\n{text}\n{}\n", "=".repeat(text.len()));
}

fn hist_header(out: &mut String, left_len: usize, left: &str, right: &str) {
    let _ = write!(out, "\n{left:>left_len$} | {right}:\n");
    let _ = write!(
        out,
        "{}+{}\n",
        "-".repeat(left_len + 1),
        "-".repeat(right.len() + 2)
    );
}

fn hist_line(out: &mut String, name_len: usize, name: &str, total: u64, part: u64) {
    if total == 0 {
        let _ = write!(out, "None\n");
        return;
    }

    let percentage = 100.0 * part as f64 / total as f64;
    let bar = "#".repeat(((total / 2 + MAX_COLS * part) / total) as usize);

    let _ = write!(out, "{name:>name_len$} | {bar} {percentage:.1}% ({part})\n");
}

fn max_name_len(items: &HashMap<String, u64>) -> usize {
    items.keys().map(String::len).max().unwrap_or(0)
}

/// Name-sorted (descending, name) pairs of a counter map.
fn sorted_by_name(mapping: &HashMap<String, u64>) -> Vec<(&str, u64)> {
    let mut list: Vec<(&str, u64)> = mapping.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    list.sort_by(|a, b| b.0.cmp(a.0));
    list
}

/// Count-sorted (descending) pairs of a counter map.
fn sorted_by_count(mapping: &HashMap<String, u64>) -> Vec<(&str, u64)> {
    let mut list: Vec<(&str, u64)> = mapping.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    list.sort_by(|a, b| b.1.cmp(&a.1));
    list
}

/// One name-sorted histogram of `mapping` against `total`.
fn node_histogram(out: &mut String, label: &str, total: u64, mapping: &HashMap<String, u64>) {
    if mapping.is_empty() {
        return;
    }

    let name_len = max_name_len(mapping).max(label.len());
    hist_header(out, name_len, label, "Completed requests");

    for (name, count) in sorted_by_name(mapping) {
        hist_line(out, name_len, name, total, count);
    }
}

/// Count-sorted `count: description` list; used when percentages do not
/// matter and the strings are too long for a histogram.
fn node_errors(out: &mut String, mapping: &HashMap<String, u64>, output: Output) {
    if mapping.is_empty() {
        return;
    }

    let _ = write!(out, "\nNode errors (count / description):\n");
    for (error, count) in sorted_by_count(mapping) {
        match output {
            Output::Plain => {
                let _ = write!(out, "- {count}: {error}\n");
            }
            Output::Html => {
                let _ = write!(out, "- {count}: {}\n", html_escape::encode_text(error));
            }
        }
    }
}

/// Statistics for all nodes, then per-node histograms and error lists.
pub fn node_report(snap: &StatsSnapshot, output: Output) -> String {
    let mut out = String::new();
    title(&mut out, "Backend / worker node statistics");

    if snap.node.is_empty() {
        let _ = write!(out, "No statistics for nodes\n");
        return out;
    }

    let mut names: Vec<&str> = snap.node.keys().map(String::as_str).collect();
    names.sort_unstable();
    let name_len = names.iter().map(|n| n.len()).max().unwrap_or(0).max(4);

    hist_header(&mut out, name_len, "Node", "Success replies");
    for name in &names {
        hist_line(
            &mut out,
            name_len,
            name,
            snap.reply.success,
            snap.node[*name].reply.success,
        );
    }

    if snap.reply.failure > 0 {
        hist_header(&mut out, name_len, "Node", "Failure replies");

        let mut total = 0;
        for name in &names {
            let failures = snap.node[*name].reply.failure;
            hist_line(&mut out, name_len, name, snap.reply.failure, failures);
            total += failures;
        }
        if total == 0 {
            let _ = write!(
                out,
                "No such replies => fails happened in communication, not running workloads\n"
            );
        }
    }

    for name in &names {
        let node = &snap.node[*name];
        title(&mut out, &format!("Node: {name}"));
        node_histogram(&mut out, "Device", node.reply.success, &node.device);
        node_errors(&mut out, &node.error, output);
    }

    out
}

/// Per-node histograms of the pods that served successful replies.
pub fn pods_report(snap: &StatsSnapshot) -> String {
    let mut out = String::new();
    title(&mut out, "Per-node backend / worker pod statistics");

    if snap.node.is_empty() {
        let _ = write!(out, "No statistics for nodes\n");
        return out;
    }

    let mut names: Vec<&str> = snap.node.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        let node = &snap.node[name];
        title(&mut out, &format!("Node: {name}"));
        node_histogram(&mut out, "Pod", node.reply.success, &node.pod);
    }

    out
}

fn max_avg_min(out: &mut String, agg: &TimeAggregate, decimals: usize, label: &str) {
    let _ = write!(
        out,
        "- {:.d$} / {:.d$} / {:.d$} - {label}\n",
        agg.max,
        agg.average(),
        agg.min,
        d = decimals
    );
}

/// The overall request / reply summary.
pub fn overall(snap: &StatsSnapshot) -> String {
    let mut out = String::new();
    title(&mut out, "Overall request / reply statistics");

    let _ = write!(
        out,
        "\n{} pending, {} failed and {} successful requests in {:.1} seconds.\n",
        snap.pending, snap.reply.failure, snap.reply.success, snap.elapsed_secs
    );

    if snap.reply.success == 0 {
        let _ = write!(
            out,
            "\nHTTP queries: {} completed, {} rejected in total\n",
            snap.completed, snap.rejected
        );
        return out;
    }

    let rps = if snap.elapsed_secs > 0.0 {
        snap.reply.success as f64 / snap.elapsed_secs
    } else {
        0.0
    };
    let _ = write!(out, "= {rps:.2} successfully completed requests / second.\n");

    let _ = write!(
        out,
        "\nMax / average / min timings (in seconds, for successful requests):\n"
    );
    max_avg_min(&mut out, &snap.run, 1, "backend run time");
    max_avg_min(&mut out, &snap.wait, 1, "queue wait time");
    max_avg_min(&mut out, &snap.comm, 3, "communication overhead");

    let _ = write!(
        out,
        "\nHTTP queries: {} completed, {} rejected in total\n",
        snap.completed, snap.rejected
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ClientStats;
    use devscale_core::proto::Reply;

    fn success_reply(node: &str, pod: &str, device: &str, runtime: f64) -> Reply {
        Reply {
            node: node.to_string(),
            pod: pod.to_string(),
            device: device.to_string(),
            runtime,
            retcode: 0,
            ..Reply::default()
        }
    }

    #[test]
    fn hist_line_scales_bar_to_share() {
        let mut out = String::new();
        hist_line(&mut out, 6, "node-a", 4, 2);
        // (4/2 + 60*2) / 4 = 30 columns for a 50% share
        assert_eq!(out, format!("node-a | {} 50.0% (2)\n", "#".repeat(30)));
    }

    #[test]
    fn hist_line_with_no_total_prints_none() {
        let mut out = String::new();
        hist_line(&mut out, 4, "name", 0, 0);
        assert_eq!(out, "None\n");
    }

    #[test]
    fn empty_node_report_says_so() {
        let stats = ClientStats::new();
        let text = node_report(&stats.snapshot(), Output::Plain);
        assert!(text.contains("Backend / worker node statistics"));
        assert!(text.contains("No statistics for nodes"));
    }

    #[test]
    fn node_report_lists_nodes_and_devices() {
        let stats = ClientStats::new();
        for _ in 0..3 {
            stats.request_started();
        }
        stats.record_success(&success_reply("node-a", "pod-1", "card0", 0.1), 0.0);
        stats.record_success(&success_reply("node-a", "pod-1", "card1", 0.2), 0.0);
        stats.record_success(&success_reply("node-b", "pod-2", "card0", 0.3), 0.0);

        let text = node_report(&stats.snapshot(), Output::Plain);
        assert!(text.contains("Node | Success replies:"));
        assert!(text.contains("Node: node-a"));
        assert!(text.contains("Node: node-b"));
        assert!(text.contains("card0"));
        assert!(text.contains("66.7% (2)"));
        // no failures: the failure histogram is omitted entirely
        assert!(!text.contains("Failure replies"));
    }

    #[test]
    fn communication_failures_are_called_out() {
        let stats = ClientStats::new();
        stats.request_started();
        stats.request_started();
        stats.record_success(&success_reply("node-a", "p", "d", 0.1), 0.0);
        // a failure without node attribution: communication, not workload
        stats.record_failure(&Reply::error("read failed"));

        let text = node_report(&stats.snapshot(), Output::Plain);
        assert!(text.contains("Node | Failure replies:"));
        assert!(text.contains("fails happened in communication"));
    }

    #[test]
    fn html_output_escapes_error_strings() {
        let stats = ClientStats::new();
        let mut reply = Reply::error("expected <dev> to exist");
        reply.node = "node-a".to_string();
        stats.request_started();
        stats.record_failure(&reply);

        let html = node_report(&stats.snapshot(), Output::Html);
        assert!(html.contains("expected &lt;dev&gt; to exist"));
        let plain = node_report(&stats.snapshot(), Output::Plain);
        assert!(plain.contains("expected <dev> to exist"));
    }

    #[test]
    fn overall_without_successes_skips_timings() {
        let stats = ClientStats::new();
        let text = overall(&stats.snapshot());
        assert!(text.contains("0 pending, 0 failed and 0 successful requests"));
        assert!(text.contains("HTTP queries: 0 completed, 0 rejected in total"));
        assert!(!text.contains("timings"));
    }

    #[test]
    fn overall_with_successes_includes_rates_and_timings() {
        let stats = ClientStats::new();
        stats.request_started();
        stats.record_success(&success_reply("n", "p", "d", 0.25), 0.01);

        let text = overall(&stats.snapshot());
        assert!(text.contains("successfully completed requests / second."));
        assert!(text.contains("backend run time"));
        assert!(text.contains("queue wait time"));
        assert!(text.contains("communication overhead"));
    }

    #[test]
    fn pods_report_groups_by_node() {
        let stats = ClientStats::new();
        stats.request_started();
        stats.record_success(&success_reply("node-a", "pod-1", "d", 0.1), 0.0);

        let text = pods_report(&stats.snapshot());
        assert!(text.contains("Per-node backend / worker pod statistics"));
        assert!(text.contains("Node: node-a"));
        assert!(text.contains("pod-1"));
    }
}
