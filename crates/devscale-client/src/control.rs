//! GET-only HTTP control surface: statistics pages, histogram reports,
//! runtime parallelism changes and statistics reset.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::body::to_bytes;
use axum::extract::{Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::controller::Command;
use crate::report::{self, Output};
use crate::stats::ClientStats;

/// Covers both headers and body: the handler rejects queries with a
/// body, so the header window bounds the whole request.
const HEADER_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_HEADER_BYTES: usize = 4096;

/// Shared handler context.
#[derive(Clone)]
pub struct ControlState {
    pub stats: Arc<ClientStats>,
    pub control: mpsc::Sender<Command>,
}

/// Recognized query parameters; everything arrives as a string and is
/// validated by the individual handlers.
#[derive(Debug, Default, Deserialize)]
struct Params {
    value: Option<String>,
    #[serde(rename = "type")]
    format: Option<String>,
}

/// Response encoding selected by the `type` form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Plain,
    Json,
    Html,
}

impl Params {
    fn format(&self) -> Format {
        match self.format.as_deref() {
            Some("plain") => Format::Plain,
            Some("json") => Format::Json,
            _ => Format::Html,
        }
    }
}

/// Serve the control endpoints on `addr`.
pub async fn serve(state: ControlState, addr: String) {
    info!(%addr, "query parallelization, statistics reset and output");

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "control listen failed");
            process::exit(1);
        }
    };

    let app = Router::new().fallback(handle).with_state(state);

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%addr, error = %e, "control accept failed");
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
                debug!(%peer, error = %e, "control connection error");
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

/// Dispatch one request. Every request ends up in exactly one of the
/// `completed` / `rejected` counters.
async fn handle(
    State(state): State<ControlState>,
    Query(params): Query<Params>,
    req: Request,
) -> Response {
    if req.method() != Method::GET {
        warn!(method = %req.method(), "bad HTTP request type");
        state.stats.http_rejected();
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if header_size(&req) > MAX_HEADER_BYTES {
        state.stats.http_rejected();
        return StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.into_response();
    }

    let path = req.uri().path().to_string();
    let Ok(body) = to_bytes(req.into_body(), MAX_HEADER_BYTES).await else {
        state.stats.http_rejected();
        return StatusCode::BAD_REQUEST.into_response();
    };
    if !body.is_empty() {
        warn!(%path, "bad HTTP request with a body");
        state.stats.http_rejected();
        return StatusCode::BAD_REQUEST.into_response();
    }

    debug!(%path, "control query");
    let format = params.format();
    let (response, completed) = match path.as_str() {
        "/stats" => (stats_page(&state, format), true),
        "/nodes" => (report::node_report(&state.stats.snapshot(), Output::Html).into_response(), true),
        "/pods" => (report::pods_report(&state.stats.snapshot()).into_response(), true),
        "/fails" => (fail_count(&state, format), true),
        "/reqs-per-sec" => (reqs_per_second(&state, format), true),
        "/parallel" => parallelization(&state, &params, format).await,
        "/reset" => (reset(&state, format), true),
        _ => {
            warn!(%path, "unrecognized HTTP URL request");
            state.stats.http_rejected();
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    if completed {
        state.stats.http_completed();
    } else {
        state.stats.http_rejected();
    }
    response
}

/// Format a single result value the way the caller asked for it.
fn result_response(format: Format, result: &str, info: &str) -> Response {
    match format {
        Format::Plain => format!("{result}\n").into_response(),
        Format::Json => {
            // numeric results go out unquoted
            if result.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                format!("{{\"result\": {result}, \"info\": \"{info}\"}}").into_response()
            } else {
                format!("{{\"result\": \"{result}\", \"info\": \"{info}\"}}").into_response()
            }
        }
        Format::Html => {
            let info = if info.is_empty() {
                String::new()
            } else {
                format!(", {info}")
            };
            Html(format!(
                "<p>{result}{info}. <a href=\"stats\">back to stats</a>.</p>\n"
            ))
            .into_response()
        }
    }
}

fn stats_page(state: &ControlState, format: Format) -> Response {
    let snap = state.stats.snapshot();
    if format == Format::Plain {
        return report::overall(&snap).into_response();
    }

    let mut page = String::from(concat!(
        "<h1>Scalability tester client</h1>\n",
        "\n",
        "<h2>Request changes</h2>\n",
        "<form action=\"parallel\" method=\"get\"><label>Requests in parallel: ",
        "<input name=\"value\"></label><button>Change</button></form>\n",
        "<form action=\"reset\" method=\"get\"><button>Reset stat metrics</button></form>\n",
        "\n",
        "<h2>Request statistics</h2>\n",
        "<p><a href=\"pods\">Per-node histograms of used backend Pods</a> (for debugging)\n",
        "<p><a href=\"nodes\">Per-node reply histograms</a>\n",
        "<form action=\"stats\" method=\"get\"><button>Refresh overall stats</button></form>\n",
        "\n",
        "<pre>\n",
    ));
    page.push_str(&report::overall(&snap));
    page.push_str("</pre>\n");
    Html(page).into_response()
}

fn fail_count(state: &ControlState, format: Format) -> Response {
    let count = state.stats.snapshot().reply.failure;
    result_response(format, &count.to_string(), "request failures")
}

fn reqs_per_second(state: &ControlState, format: Format) -> Response {
    let snap = state.stats.snapshot();
    let rps = if snap.elapsed_secs > 0.0 {
        snap.reply.success as f64 / snap.elapsed_secs
    } else {
        0.0
    };
    result_response(format, &format!("{rps:.6}"), "requests per second")
}

/// Push a new target to the controller and answer with the effective
/// (clamped) value.
async fn parallelization(
    state: &ControlState,
    params: &Params,
    format: Format,
) -> (Response, bool) {
    info!(value = ?params.value, "parallelization request");
    eprint!("{}", report::overall(&state.stats.snapshot()));

    let value: i64 = match params.value.as_deref().unwrap_or("").parse() {
        Ok(value) => value,
        Err(e) => return (result_response(format, "ERROR", &e.to_string()), false),
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = state
        .control
        .send(Command::SetParallel {
            value,
            reply: reply_tx,
        })
        .await;
    if sent.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR.into_response(), false);
    }

    match reply_rx.await {
        Ok(target) => (
            result_response(format, &target.to_string(), "requests in parallel"),
            true,
        ),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR.into_response(), false),
    }
}

fn reset(state: &ControlState, format: Format) -> Response {
    info!("stats reset request");
    eprint!("{}", report::overall(&state.stats.snapshot()));

    state.stats.reset();
    info!("stats reset");
    result_response(format, "Reset", "")
}
