mod exporter;
mod listeners;

use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use devscale_core::queue::QueueSet;
use devscale_core::signal::shutdown_signal;
use devscale_core::telemetry;

pub const PROJECT: &str = "Device scalability tester - frontend";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The `# project version` line heading the metrics page.
pub fn project_header() -> String {
    format!("{PROJECT} v{VERSION}")
}

#[derive(Parser)]
#[command(name = "devscale-frontend", about = "Device scalability tester frontend", version)]
struct Cli {
    /// Address to listen on for client service requests
    #[arg(long, default_value = "localhost:9997")]
    caddr: String,

    /// Address to listen on for worker work item requests
    #[arg(long, default_value = "localhost:9999")]
    waddr: String,

    /// Address to listen on for Prometheus metric queries
    #[arg(long, default_value = "localhost:9998")]
    maddr: String,

    /// Max queue size after which requests are denied (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    qmax: usize,

    /// Log queue statistics at this interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 0)]
    interval: u64,

    /// Log all messages
    #[arg(long)]
    verbose: bool,

    /// Queue names to serve
    #[arg(required = true)]
    queues: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);
    info!("{PROJECT} v{VERSION}");

    let queues = match QueueSet::new(&cli.queues, cli.qmax, cli.interval) {
        Ok(queues) => Arc::new(queues),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };
    info!(queues = ?queues.names(), "queues added");

    tokio::spawn(listeners::listen_for_clients(
        Arc::clone(&queues),
        cli.caddr.clone(),
    ));
    tokio::spawn(listeners::listen_for_workers(
        Arc::clone(&queues),
        cli.waddr.clone(),
    ));
    tokio::spawn(exporter::serve_metrics(
        Arc::clone(&queues),
        cli.maddr.clone(),
    ));

    if cli.interval > 0 {
        tokio::spawn(exporter::log_stats(Arc::clone(&queues)));
    }

    // exit 0 when asked nicely to terminate; in-flight dispatches are
    // abandoned and their connections close with the process
    shutdown_signal().await;
    info!("termination signal received");
}
