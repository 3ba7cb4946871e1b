//! Prometheus metrics endpoint and the optional periodic stats logger.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use devscale_core::metrics;
use devscale_core::queue::QueueSet;

const METRIC_URL: &str = "/metrics";
/// Covers both headers and body: the handler rejects queries with a
/// body, so the header window bounds the whole request.
const HEADER_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_HEADER_BYTES: usize = 4096;

/// Serve Prometheus metric queries on `addr`.
pub async fn serve_metrics(queues: Arc<QueueSet>, addr: String) {
    info!(%addr, url = METRIC_URL, "listening for queue metric queries");

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "metrics listen failed");
            process::exit(1);
        }
    };

    let app = Router::new().fallback(exporter).with_state(queues);

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%addr, error = %e, "metrics accept failed");
                continue;
            }
        };

        let service = app.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(conn);
            let hyper_service =
                hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                    service.clone().oneshot(request)
                });
            let served = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_TIMEOUT)
                .serve_connection(io, hyper_service)
                .await;
            if let Err(e) = served {
                debug!(%peer, error = %e, "metrics connection error");
            }
        });
    }
}

fn header_size(req: &Request) -> usize {
    req.headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum()
}

/// GET with bounded headers and an empty body on the metrics path;
/// everything else is rejected with the matching status.
async fn exporter(State(queues): State<Arc<QueueSet>>, req: Request) -> Response {
    if req.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if header_size(&req) > MAX_HEADER_BYTES {
        return StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.into_response();
    }
    if req.uri().path() != METRIC_URL {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Ok(body) = to_bytes(req.into_body(), MAX_HEADER_BYTES).await else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if !body.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    debug!("metrics query");
    metrics::render(&queues, &crate::project_header()).into_response()
}

/// Log queue statistics at the configured interval, resetting the max
/// watermarks after each output.
pub async fn log_stats(queues: Arc<QueueSet>) {
    let seconds = queues.interval();
    info!(seconds, "logging queue statistics");
    let interval = Duration::from_secs(seconds);

    loop {
        tokio::time::sleep(interval).await;

        for snap in queues.snapshots(true) {
            info!(
                queue = %snap.name,
                success = snap.success,
                failure = snap.failure,
                running = snap.running,
                max_run = snap.max_run,
                waiting = snap.waiting,
                max_wait = snap.max_wait,
                max_total = snap.max_total,
                disconnect = snap.disconnect,
                "queue statistics"
            );
        }

        let conns = queues.connections();
        info!(
            clients = conns.clients,
            metrics = conns.metrics,
            workers = conns.workers,
            "connection totals"
        );
    }
}
