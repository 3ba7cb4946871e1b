mod control;
mod controller;
mod report;
mod requester;
mod stats;

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use devscale_core::proto::{self, ServiceRequest};
use devscale_core::signal::shutdown_signal;
use devscale_core::telemetry;

use control::ControlState;
use controller::Controller;
use report::Output;
use stats::ClientStats;

pub const PROJECT: &str = "Device scalability tester - client";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard cap on the requester slot pool.
const REQ_LIMIT: usize = 512;

#[derive(Parser)]
#[command(name = "devscale-client", about = "Device scalability tester client", version)]
struct Cli {
    /// Query parallelization control and statistics reset / output address
    #[arg(long, default_value = "localhost:9996")]
    caddr: String,

    /// Frontend service address for client requests
    #[arg(long, default_value = "localhost:9997")]
    faddr: String,

    /// Backend runtime limit in seconds (0 = none)
    #[arg(long, default_value_t = 0.0)]
    limit: f64,

    /// Service request queue name (positional args go into requests as-is)
    #[arg(long, default_value = "sleep")]
    name: String,

    /// Maximum number of parallel requests adjustable at runtime
    #[arg(long, default_value_t = 2)]
    req_max: usize,

    /// Initial number of parallel requests
    #[arg(long, default_value_t = 1)]
    req_now: usize,

    /// Log all messages
    #[arg(long)]
    verbose: bool,

    /// Extra workload arguments included in every request
    args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);
    info!("{PROJECT} v{VERSION}");

    if cli.req_now > cli.req_max || cli.req_max > REQ_LIMIT {
        error!(
            req_now = cli.req_now,
            req_max = cli.req_max,
            "invalid parallelization: req-now <= req-max <= 512 required"
        );
        process::exit(1);
    }

    // every request is identical, so encode it once up front
    let request = ServiceRequest {
        queue: cli.name.clone(),
        args: cli.args.clone(),
        limit: cli.limit,
    };
    let data = match proto::encode(&request) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "client request encoding failed");
            process::exit(1);
        }
    };
    info!(
        faddr = %cli.faddr,
        parallel = cli.req_now,
        request = %String::from_utf8_lossy(&data),
        "sending requests"
    );

    let stats = Arc::new(ClientStats::new());

    let (control_tx, control_rx) = mpsc::channel(1);
    tokio::spawn(control::serve(
        ControlState {
            stats: Arc::clone(&stats),
            control: control_tx,
        },
        cli.caddr.clone(),
    ));

    let (controller, proceed_rxs, finished_tx) = Controller::new(cli.req_max, cli.req_now);
    let request_data = Arc::new(data);
    for (slot, proceed_rx) in proceed_rxs.into_iter().enumerate() {
        tokio::spawn(requester::run(
            slot,
            proceed_rx,
            finished_tx.clone(),
            cli.faddr.clone(),
            Arc::clone(&request_data),
            Arc::clone(&stats),
        ));
    }
    drop(finished_tx);

    info!("SIGHUP/SIGINT/SIGTERM to terminate");
    controller.run(control_rx, shutdown_signal()).await;

    // final reports on the terminal before exiting
    let snap = stats.snapshot();
    print!("{}", report::node_report(&snap, Output::Plain));
    print!("{}", report::overall(&snap));
}
