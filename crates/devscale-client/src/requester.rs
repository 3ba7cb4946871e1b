//! One requester slot: a long-lived task that runs one request per
//! go-ahead token over a fresh connection to the frontend.

use std::process;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use devscale_core::error::ProtoError;
use devscale_core::proto::{self, Reply};
use devscale_core::wire;

use crate::stats::ClientStats;

/// Request-path errors. All of these are fatal for the whole process: a
/// client that cannot talk to its frontend has nothing left to measure.
#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("connection to '{addr}' failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("request send failed: {0}")]
    Send(std::io::Error),

    #[error("reply read failed: {0}")]
    Read(std::io::Error),

    #[error(transparent)]
    Decode(ProtoError),

    #[error("request reply misses node name")]
    MissingNode,
}

/// Wait for a go-ahead, run one request, signal completion, repeat.
/// Returns when the go-ahead channel closes (controller gone).
pub async fn run(
    slot: usize,
    mut proceed: mpsc::Receiver<()>,
    finished: mpsc::Sender<usize>,
    addr: String,
    request: Arc<Vec<u8>>,
    stats: Arc<ClientStats>,
) {
    while proceed.recv().await.is_some() {
        if let Err(e) = one_request(&addr, &request, &stats).await {
            error!(slot, error = %e, "request failed");
            process::exit(1);
        }
        if finished.send(slot).await.is_err() {
            return;
        }
    }
}

/// Send the pre-encoded request over a fresh connection, read the reply
/// and fold it into the statistics. A remote error reply is a counted
/// failure, not an error.
async fn one_request(addr: &str, request: &[u8], stats: &ClientStats) -> Result<(), RequestError> {
    let start = Instant::now();
    stats.request_started();

    let mut conn = TcpStream::connect(addr)
        .await
        .map_err(|source| RequestError::Connect {
            addr: addr.to_string(),
            source,
        })?;

    wire::write_message(&mut conn, request)
        .await
        .map_err(RequestError::Send)?;

    let data = wire::read_message(&mut conn)
        .await
        .map_err(RequestError::Read)?;
    debug!(bytes = data.len(), "reply received");

    let reply: Reply = proto::decode(&data).map_err(RequestError::Decode)?;

    if !reply.error.is_empty() {
        warn!(error = %reply.error, "request received remote error");
        stats.record_failure(&reply);
        return Ok(());
    }

    // a success reply without node attribution means a broken backend
    if reply.node.is_empty() {
        return Err(RequestError::MissingNode);
    }

    let comm = start.elapsed().as_secs_f64() - reply.wait_time - reply.runtime;
    debug!(
        wait = reply.wait_time,
        run = reply.runtime,
        comm,
        "reply timings"
    );
    stats.record_success(&reply, comm);

    Ok(())
}
