//! JSON-over-HTTP surface for the engine.
//!
//! One request per connection, parsed with `httparse`; every response is JSON
//! and carries permissive CORS headers. Routing is a pure function
//! ([`handle`]) so it can be tested without sockets.
//!
//! | Method | Path | Call |
//! |---|---|---|
//! | POST | `/api/experiments` | `create_experiment` |
//! | GET | `/api/experiments?site_id=&status=&type=` | `list_experiments` |
//! | GET | `/api/experiments/{id}` | `get_experiment` |
//! | POST | `/api/experiments/{id}/status` | `set_status` |
//! | POST | `/api/assign` | `assign_for_site` / `assign_variant` |
//! | POST | `/api/results` | `record_result` |
//! | GET | `/api/analyze?experiment_id=` or `?site_id=` | `analyze_experiment` / `sweep` |
//! | GET | `/health` | |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::engine::{ExperimentEngine, ExperimentStatus, NewExperiment, ResultInput};
use crate::error::{EngineError, Result};
use crate::store::ExperimentFilter;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

// ---------------------------------------------------------------------------
// Query helpers
// ---------------------------------------------------------------------------

/// Percent-decoding for URL query parameters and path segments.
pub fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex: Vec<u8> = iter.by_ref().take(2).collect();
                if let Some(byte) = std::str::from_utf8(&hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    bytes.push(byte);
                }
            }
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse query string into key-value pairs.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// Failures before a request reaches the router.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request body of {0} bytes exceeds the 1 MiB limit")]
    BodyTooLarge(usize),

    #[error("request head too large")]
    HeadTooLarge,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RequestError {
    pub fn http_status(&self) -> u16 {
        match self {
            RequestError::Malformed(_) => 400,
            RequestError::BodyTooLarge(_) => 413,
            RequestError::HeadTooLarge => 431,
            RequestError::Io(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: String,
    pub content_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub head: RequestHead,
    pub body: Vec<u8>,
}

/// Parse the request line and headers. `Ok(None)` means more bytes are needed;
/// on success the head's length in `buf` is returned too.
pub fn parse_head(buf: &[u8]) -> std::result::Result<Option<(RequestHead, usize)>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    };

    let method = req.method.unwrap_or("GET").to_ascii_uppercase();
    let target = req.path.unwrap_or("/");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let mut content_length = 0;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| RequestError::Malformed("invalid Content-Length".into()))?;
        }
    }

    Ok(Some((
        RequestHead { method, path: path.to_string(), query: query.to_string(), content_length },
        len,
    )))
}

/// Read one request. `Ok(None)` if the peer closed before sending anything.
pub async fn read_request<R>(stream: &mut R) -> std::result::Result<Option<Request>, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some((head, used)) = parse_head(&buf)? {
            if head.content_length > MAX_BODY_BYTES {
                return Err(RequestError::BodyTooLarge(head.content_length));
            }
            let mut body = buf.split_off(used);
            while body.len() < head.content_length {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(RequestError::Malformed("body shorter than Content-Length".into()));
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body.truncate(head.content_length);
            return Ok(Some(Request { head, body }));
        }

        if buf.len() > MAX_HEAD_BYTES {
            return Err(RequestError::HeadTooLarge);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(RequestError::Malformed("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    /// `None` only for `204 No Content`.
    pub body: Option<Value>,
}

impl Response {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body: Some(body) }
    }

    pub fn ok(body: Value) -> Self {
        Self::json(200, body)
    }

    pub fn no_content() -> Self {
        Self { status: 204, body: None }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": message.into() }))
    }

    /// Serialize to HTTP/1.1 bytes with CORS headers.
    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n\
             Connection: close\r\n",
            self.status,
            reason_phrase(self.status)
        );
        let body = match &self.body {
            Some(value) => value.to_string(),
            None => String::new(),
        };
        if self.body.is_some() {
            head.push_str("Content-Type: application/json\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(body.as_bytes());
        out
    }
}

impl From<&EngineError> for Response {
    fn from(e: &EngineError) -> Self {
        Response::error(e.http_status(), e.to_string())
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        _ => "Internal Server Error",
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AssignRequest {
    #[serde(default)]
    site_id: String,
    #[serde(default)]
    visitor_id: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    /// Bypass site selection and assign within this experiment.
    #[serde(default)]
    experiment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    #[serde(default)]
    action: String,
}

fn json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(EngineError::validation("request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|e| EngineError::validation(format!("invalid JSON body: {e}")))
}

fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Route one request to the engine.
pub fn handle(
    engine: &ExperimentEngine,
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
) -> Response {
    if method == "OPTIONS" {
        return Response::no_content();
    }

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(url_decode)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let result = match (method, segments.as_slice()) {
        ("GET", ["health"]) => Ok(Response::ok(json!({ "status": "ok" }))),
        ("POST", ["api", "experiments"]) => create_experiment(engine, body),
        ("GET", ["api", "experiments"]) => list_experiments(engine, query),
        ("GET", ["api", "experiments", id]) => {
            engine.get_experiment(id).and_then(|e| Ok(Response::ok(serde_json::to_value(e)?)))
        }
        ("POST", ["api", "experiments", id, "status"]) => set_status(engine, id, body),
        ("POST", ["api", "assign"]) => assign(engine, body),
        ("POST", ["api", "results"]) => record_result(engine, body),
        ("GET", ["api", "analyze"]) => analyze(engine, query),
        (_, ["health"])
        | (_, ["api", "experiments"])
        | (_, ["api", "experiments", _])
        | (_, ["api", "experiments", _, "status"])
        | (_, ["api", "assign"])
        | (_, ["api", "results"])
        | (_, ["api", "analyze"]) => {
            Ok(Response::error(405, format!("{method} not allowed on {path}")))
        }
        _ => Ok(Response::error(404, format!("no route for {path}"))),
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            if e.is_client_error() {
                debug!(target: "ab_engine::web", method, path, error = %e, "request rejected");
            } else {
                error!(target: "ab_engine::web", method, path, error = %e, "request failed");
            }
            Response::from(&e)
        }
    }
}

fn create_experiment(engine: &ExperimentEngine, body: &[u8]) -> Result<Response> {
    let input: NewExperiment = json_body(body)?;
    let experiment = engine.create_experiment(input)?;
    Ok(Response::json(
        201,
        json!({
            "id": experiment.id,
            "status": experiment.status,
            "traffic_split": experiment.traffic_split,
        }),
    ))
}

fn list_experiments(engine: &ExperimentEngine, query: &str) -> Result<Response> {
    let params = parse_query(query);
    let mut filter = ExperimentFilter::default().with_kind(non_empty(&params, "type"));
    filter.site_id = non_empty(&params, "site_id");
    if let Some(status) = non_empty(&params, "status") {
        filter = filter.with_status(status.parse::<ExperimentStatus>()?);
    }
    let experiments = engine.list_experiments(&filter)?;
    Ok(Response::ok(json!({ "experiments": experiments })))
}

fn set_status(engine: &ExperimentEngine, id: &str, body: &[u8]) -> Result<Response> {
    let request: StatusRequest = json_body(body)?;
    let status = engine.set_status(id, &request.action)?;
    Ok(Response::ok(json!({ "id": id, "status": status })))
}

fn assign(engine: &ExperimentEngine, body: &[u8]) -> Result<Response> {
    let request: AssignRequest = json_body(body)?;
    let experiment_id = request.experiment_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let assignment = match experiment_id {
        Some(experiment_id) => engine.assign_variant(experiment_id, &request.visitor_id)?,
        None => {
            engine.assign_for_site(&request.site_id, &request.visitor_id, request.kind.as_deref())?
        }
    };
    Ok(Response::ok(serde_json::to_value(assignment)?))
}

fn record_result(engine: &ExperimentEngine, body: &[u8]) -> Result<Response> {
    let input: ResultInput = json_body(body)?;
    let outcome = engine.record_result(input)?;
    Ok(Response::ok(json!({ "recorded": true, "counted": outcome.counted })))
}

fn analyze(engine: &ExperimentEngine, query: &str) -> Result<Response> {
    let params = parse_query(query);
    if let Some(id) = non_empty(&params, "experiment_id") {
        let analysis = engine.analyze_experiment(&id)?;
        return Ok(Response::ok(serde_json::to_value(analysis)?));
    }
    if let Some(site_id) = non_empty(&params, "site_id") {
        let analyses = engine.sweep(Some(&site_id))?;
        return Ok(Response::ok(json!({ "analyses": analyses })));
    }
    Err(EngineError::validation("experiment_id or site_id is required"))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serve one request on `stream` and close it.
pub async fn handle_connection<S>(
    mut stream: S,
    engine: Arc<ExperimentEngine>,
) -> std::result::Result<(), RequestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = match read_request(&mut stream).await {
        Ok(Some(req)) => {
            let method = req.head.method.clone();
            let path = req.head.path.clone();
            // Store calls block; keep them off the async workers.
            let response = tokio::task::spawn_blocking(move || {
                handle(&engine, &req.head.method, &req.head.path, &req.head.query, &req.body)
            })
            .await
            .unwrap_or_else(|e| {
                error!(target: "ab_engine::web", error = %e, "request handler aborted");
                Response::error(500, "internal error")
            });
            debug!(
                target: "ab_engine::web",
                method = %method,
                path = %path,
                status = response.status,
                "request"
            );
            response
        }
        Ok(None) => return Ok(()),
        Err(RequestError::Io(e)) => return Err(RequestError::Io(e)),
        Err(e) => {
            debug!(target: "ab_engine::web", error = %e, "unparseable request");
            Response::error(e.http_status(), e.to_string())
        }
    };
    stream.write_all(&response.encode()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Periodically sweep every active experiment. Runs until the task is aborted.
pub async fn sweep_loop(engine: Arc<ExperimentEngine>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; the first sweep waits one period.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let sweeper = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || sweeper.sweep(None)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(
                    target: "ab_engine::web",
                    error = %e,
                    "scheduled sweep failed, will retry next tick"
                );
            }
            Err(e) => error!(target: "ab_engine::web", error = %e, "scheduled sweep aborted"),
        }
    }
}

/// Accept connections on `listener` forever.
///
/// `sweep_every = None` disables the scheduled sweep.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<ExperimentEngine>,
    sweep_every: Option<Duration>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    eprintln!("{}", format!("  A/B engine listening on http://{addr}").bright_green());
    match sweep_every {
        Some(every) => {
            eprintln!(
                "{}",
                format!("  Sweeping active experiments every {}s", every.as_secs()).bright_blue()
            );
            tokio::spawn(sweep_loop(Arc::clone(&engine), every));
        }
        None => eprintln!("{}", "  Scheduled sweep disabled".yellow()),
    }
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    info!(target: "ab_engine::web", %addr, "server started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, engine).await {
                warn!(target: "ab_engine::web", %peer, error = %e, "connection error");
            }
        });
    }
}
