//! Admin HTTP surface (spec.md §6): `GET /metrics`, `GET /protocol/metrics`, `POST /-/logger`,
//! `POST /-/reload`, `GET /watch`.
//!
//! Grounded on the teacher's `stats::serve_req`: a `hyper` handler that renders a
//! `prometheus_client::Registry` into `Full<Bytes>`. The teacher never wires an actual listener (it
//! hands `serve_req` to an external harness), so the accept loop here is assembled from the same
//! `hyper`/`hyper-util`/`tokio` "full"-featured stack the teacher depends on:
//! `tokio::net::TcpListener` + `hyper_util::server::conn::auto` + `hyper::service::service_fn`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use http_body_util::{Either, Full};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;

use crate::config::RuntimeConfig;
use crate::fanout::PubSub;
use crate::portpool::PortPoolRegistry;
use crate::stats::Stats;

/// Shared state reachable from every admin connection. Built once at startup and handed to
/// [`serve`]; `registry` is swapped in place by `POST /-/reload` (spec.md §4.2 "Reload").
pub struct AdminState {
    pub stats: Arc<Stats>,
    pub pubsub: Arc<PubSub>,
    pub registry: RwLock<Arc<PortPoolRegistry>>,
    pub config_path: Option<PathBuf>,
    pub max_connections: usize,
    pub max_message_size: usize,
}

impl AdminState {
    pub fn current_registry(&self) -> Arc<PortPoolRegistry> {
        self.registry.read().unwrap().clone()
    }
}

type RespBody = Either<Full<Bytes>, WatchBody>;

/// Binds `addr` and serves admin requests until the returned task is aborted or the process exits
/// (spec.md §6 "Admin HTTP server"). One connection per accepted socket, handled concurrently.
pub async fn serve(addr: SocketAddr, state: Arc<AdminState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("admin server listening on {}", addr);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("admin: accept failed: {}", e);
                continue;
            }
        };
        let state = state.clone();
        tokio::task::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(req, state.clone()));
            if let Err(e) = auto::Builder::new(TokioExecutor::new()).serve_connection(io, service).await {
                log::debug!("admin: connection from {} closed: {}", peer, e);
            }
        });
    }
}

async fn handle(req: Request<Incoming>, state: Arc<AdminState>) -> Result<Response<RespBody>, Infallible> {
    let path = req.uri().path().to_string();
    let query: std::collections::HashMap<String, String> = req
        .uri()
        .query()
        .map(parse_query)
        .unwrap_or_default();

    let resp = match (req.method(), path.as_str()) {
        (&Method::GET, "/metrics") => text_response(state.stats.encode_text()),
        (&Method::GET, "/protocol/metrics") => text_response(state.stats.encode_protocol_text()),
        (&Method::POST, "/-/logger") => handle_logger(&query),
        (&Method::POST, "/-/reload") => handle_reload(&state),
        (&Method::GET, "/watch") => return Ok(handle_watch(&state, &query)),
        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(resp.map(Either::Left))
}

fn parse_query(q: &str) -> std::collections::HashMap<String, String> {
    q.split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut it = pair.splitn(2, '=');
            let key = it.next()?;
            let value = it.next().unwrap_or("");
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn text_response(body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// `POST /-/logger?level=debug` adjusts the process-wide log level at runtime (spec.md §6).
fn handle_logger(query: &std::collections::HashMap<String, String>) -> Response<Full<Bytes>> {
    let Some(level) = query.get("level") else {
        return plain_response(StatusCode::BAD_REQUEST, "missing ?level=");
    };
    match log::LevelFilter::from_str(level) {
        Ok(filter) => {
            log::set_max_level(filter);
            log::info!("log level set to {} via admin endpoint", filter);
            plain_response(StatusCode::OK, "ok")
        }
        Err(_) => plain_response(StatusCode::BAD_REQUEST, "invalid level"),
    }
}

/// `POST /-/reload` re-reads the config file and atomically swaps the routing table, keeping
/// connections alive in surviving pools (spec.md §4.2, §7 "Reload").
fn handle_reload(state: &AdminState) -> Response<Full<Bytes>> {
    let Some(path) = &state.config_path else {
        return plain_response(StatusCode::BAD_REQUEST, "no config file to reload from");
    };
    let Some(new_cfg) = crate::config::try_load_config(path) else {
        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "reload failed, previous config kept");
    };
    apply_reload(state, &new_cfg);
    plain_response(StatusCode::OK, "reloaded")
}

/// Rebuilds the routing table from `new_cfg` and swaps it in, reusing surviving pools. Shared by
/// the admin endpoint and the agent's periodic file watcher (spec.md §7).
pub fn apply_reload(state: &AdminState, new_cfg: &RuntimeConfig) {
    let previous = state.current_registry();
    let rebuilt = PortPoolRegistry::build(
        &new_cfg.protocols,
        state.max_connections,
        new_cfg.conntrack.conn_expired(),
        state.max_message_size,
        Some(&previous),
    );
    *state.registry.write().unwrap() = Arc::new(rebuilt);
    log::info!("config reloaded: {} protocol pools active", new_cfg.protocols.len());
}

/// `GET /watch?max_message=N&timeout=Ds` streams up to `N` JSON round-trips from the pub/sub, or
/// until `D` seconds elapse (spec.md §6).
fn handle_watch(state: &AdminState, query: &std::collections::HashMap<String, String>) -> Response<RespBody> {
    let max_message: usize = query.get("max_message").and_then(|v| v.parse().ok()).unwrap_or(100);
    let timeout = query
        .get("timeout")
        .and_then(|v| v.trim_end_matches('s').parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));

    let (sub_id, crossbeam_rx) = state.pubsub.subscribe();
    let pubsub = state.pubsub.clone();
    let (tokio_tx, tokio_rx) = tokio::sync::mpsc::channel::<Bytes>(8);

    tokio::task::spawn_blocking(move || {
        let deadline = std::time::Instant::now() + timeout;
        let mut sent = 0usize;
        while sent < max_message {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match crossbeam_rx.recv_timeout(remaining) {
                Ok(line) => {
                    let mut bytes = Vec::with_capacity(line.len() + 1);
                    bytes.extend_from_slice(line.as_bytes());
                    bytes.push(b'\n');
                    if tokio_tx.blocking_send(Bytes::from(bytes)).is_err() {
                        break;
                    }
                    sent += 1;
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => break,
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        pubsub.unsubscribe(sub_id);
    });

    let body = WatchBody { rx: tokio_rx };
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/x-ndjson")
        .body(Either::Right(body))
        .unwrap()
}

/// A streaming response body backed by a `tokio::sync::mpsc` channel, fed by a blocking task
/// draining a [`crate::fanout::PubSub`] subscriber queue. Avoids pulling in a `Stream`-combinator
/// crate for what is otherwise a one-shot forwarding loop.
pub struct WatchBody {
    rx: tokio::sync::mpsc::Receiver<Bytes>,
}

impl Body for WatchBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_pairs() {
        let q = parse_query("max_message=10&timeout=5s");
        assert_eq!(q.get("max_message").map(String::as_str), Some("10"));
        assert_eq!(q.get("timeout").map(String::as_str), Some("5s"));
    }

    #[test]
    fn parses_empty_query() {
        assert!(parse_query("").is_empty());
    }
}
