mod workload;

use std::process;

use clap::Parser;
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use devscale_core::proto::{self, Reply, WorkItem, WorkRequest};
use devscale_core::signal::shutdown_signal;
use devscale_core::telemetry;
use devscale_core::wire;

use workload::{StdioPolicy, Workload};

pub const PROJECT: &str = "Device scalability tester - backend";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "devscale-backend", about = "Device scalability tester backend", version)]
struct Cli {
    /// Frontend service address for the backend work queue
    #[arg(long, default_value = "localhost:9999")]
    faddr: String,

    /// When the queue is empty, retry after N * backoff seconds instead
    /// of exiting (0 = disabled)
    #[arg(long, default_value_t = 0.0)]
    backoff: f64,

    /// Maximum backoff value in seconds
    #[arg(long, default_value_t = 5.0)]
    backoff_max: f64,

    /// Workload invocation runtime limit in seconds (0 = none)
    #[arg(long, default_value_t = 0.0)]
    limit: f64,

    /// Ignore extra workload arguments provided in client requests
    #[arg(long)]
    ignore: bool,

    /// Run the workload directly and exit (for command testing)
    #[arg(long)]
    once: bool,

    /// Working directory for the backend workload
    #[arg(long, default_value = "")]
    dir: String,

    /// Glob pattern for (device) file names; the match replaces
    /// 'FILENAME' in work item args
    #[arg(long, default_value = "")]
    glob: String,

    /// Backend work items queue name
    #[arg(long, default_value = "sleep")]
    name: String,

    /// Get the reply node name from this variable instead of the hostname
    #[arg(long, default_value = "")]
    node_env: String,

    /// Get the reply pod name from this variable instead of the hostname
    #[arg(long, default_value = "")]
    pod_env: String,

    /// Map workload stdin to /dev/null
    #[arg(long)]
    null_in: bool,

    /// Map workload stdout/stderr to /dev/null
    #[arg(long)]
    null_out: bool,

    /// Log all messages
    #[arg(long)]
    verbose: bool,

    /// Workload program and arguments ('sleep' or an absolute path)
    #[arg(required = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Identity of this worker in replies.
struct Identity {
    node: String,
    pod: String,
    device: String,
}

/// Value of the named environment variable, if it names one that is set
/// and non-empty.
fn env_override(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Resolve node and pod names from the environment overrides, falling
/// back to the hostname (in kubernetes the hostname is the pod name).
/// No override and no hostname is a configuration error.
fn resolve_identity(cli: &Cli, device: Option<&str>) -> Identity {
    let host = hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty());

    let node = match env_override(&cli.node_env).or_else(|| host.clone()) {
        Some(node) => node,
        None => {
            error!("hostname unavailable and no --node-env override");
            process::exit(1);
        }
    };
    let pod = match env_override(&cli.pod_env).or(host) {
        Some(pod) => pod,
        None => {
            error!("hostname unavailable and no --pod-env override");
            process::exit(1);
        }
    };

    Identity {
        node,
        pod,
        // without a device file the reply carries ".", the base name of
        // the empty path
        device: device
            .map(workload::base_name)
            .unwrap_or_else(|| ".".to_string()),
    }
}

/// One poll round trip. Queue-empty with backoff enabled yields `None`;
/// without backoff the process exits 0. Every other error is fatal,
/// since the backend has no state worth preserving.
async fn get_work(addr: &str, request: &[u8], backoff: bool) -> Option<(TcpStream, WorkItem)> {
    let mut conn = match TcpStream::connect(addr).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(%addr, error = %e, "connection failed");
            process::exit(1);
        }
    };

    if let Err(e) = wire::write_message(&mut conn, request).await {
        error!(error = %e, "request send failed");
        process::exit(1);
    }
    let data = match wire::read_message(&mut conn).await {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "request reply read failed");
            process::exit(1);
        }
    };
    debug!(bytes = data.len(), "work item received");

    let item: WorkItem = match proto::decode(&data) {
        Ok(item) => item,
        Err(e) => {
            error!(error = %e, "work item decoding failed");
            process::exit(1);
        }
    };

    if !item.error.is_empty() {
        if item.empty {
            if backoff {
                return None;
            }
            info!(reason = %item.error, "terminating");
            process::exit(0);
        }
        error!(error = %item.error, "server returned error");
        process::exit(1);
    }

    Some((conn, item))
}

/// Send the reply and close the connection. The frontend going away
/// mid-reply is fatal, like every other frontend communication error.
async fn send_reply_close(mut conn: TcpStream, reply: &Reply) {
    let data = match proto::encode(reply) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "reply encoding failed");
            process::exit(1);
        }
    };
    debug!(bytes = data.len(), "closing reply");
    if let Err(e) = wire::write_message(&mut conn, &data).await {
        error!(error = %e, "reply send failed");
        process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);
    info!("{PROJECT} v{VERSION}");

    let device = match workload::resolve_device(&cli.glob) {
        Ok(device) => device,
        Err(e) => {
            error!(error = %e, "device file resolution failed");
            process::exit(1);
        }
    };

    let args = match workload::map_args(&cli.args, device.as_deref()) {
        Ok(args) => args,
        Err(e) => {
            error!(error = %e, "workload argument mapping failed");
            process::exit(1);
        }
    };

    let stdio = StdioPolicy {
        null_in: cli.null_in,
        null_out: cli.null_out,
    };
    let dir = if cli.dir.is_empty() {
        None
    } else {
        Some(cli.dir.clone())
    };
    let work = match Workload::new(args, dir, stdio, cli.limit) {
        Ok(work) => work,
        Err(e) => {
            error!(error = %e, "invalid workload");
            process::exit(1);
        }
    };

    if cli.backoff < 0.0 || cli.backoff_max < cli.backoff {
        error!(
            backoff = cli.backoff,
            backoff_max = cli.backoff_max,
            "invalid backoff values: 0 <= backoff <= backoff-max required"
        );
        process::exit(1);
    }

    let identity = resolve_identity(&cli, device.as_deref());
    info!(
        node = %identity.node,
        pod = %identity.pod,
        workload = ?work.args(),
        "backend workload configured"
    );
    if work.limit() > 0.0 {
        info!(limit = work.limit(), "run-time limit enforced");
    }

    if cli.once {
        info!("running command directly (--once)");
        work.execute(&[], work.limit()).await;
        return;
    }

    let request = match proto::encode(&WorkRequest {
        queue: cli.name.clone(),
    }) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "work request encoding failed");
            process::exit(1);
        }
    };
    info!(queue = %cli.name, faddr = %cli.faddr, "sending work requests");

    // catch user and kubernetes interrupts to exit gracefully between
    // requests
    let (sig_tx, sig_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = sig_tx.send(true);
    });

    let mut total = cli.backoff;
    let mut completed = 0u64;

    loop {
        match get_work(&cli.faddr, &request, cli.backoff > 0.0).await {
            None => {
                let delay = next_backoff(total, cli.backoff_max, cli.limit);
                info!(seconds = delay, "queue empty, backing off");
                tokio::time::sleep(std::time::Duration::from_millis((1000.0 * delay) as u64))
                    .await;
                total = delay + cli.backoff;
            }
            Some((conn, item)) => {
                total = cli.backoff;

                let mut reply = if cli.ignore {
                    work.execute(&[], item.limit).await
                } else {
                    match workload::map_args(&item.args, device.as_deref()) {
                        Ok(extra) => work.execute(&extra, item.limit).await,
                        Err(e) => Reply::error(e.to_string()),
                    }
                };
                reply.node = identity.node.clone();
                reply.pod = identity.pod.clone();
                reply.device = identity.device.clone();

                send_reply_close(conn, &reply).await;
                completed += 1;
            }
        }

        if *sig_rx.borrow() {
            info!(completed, "termination signal received");
            return;
        }
    }
}

/// The sleep before the next poll: the accumulated backoff capped by the
/// maximum and, when one is configured, by the workload run-time limit.
fn next_backoff(total: f64, max: f64, limit: f64) -> f64 {
    let mut delay = total.min(max);
    if limit > 0.0 && delay > limit {
        delay = limit;
    }
    delay
}
