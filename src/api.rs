//! HTTP API for starting, stopping and inspecting user servers
//!
//! - `GET    /health`, `GET /version` (no auth)
//! - `GET    /servers`
//! - `GET    /servers/{owner}[/{name}]`
//! - `POST   /servers/{owner}[/{name}]` with optional JSON options
//! - `DELETE /servers/{owner}[/{name}]` with optional `{"remove": bool}`
//! - `GET    /servers/{owner}[/{name}]/progress` (server-sent events)
//! - `POST   /servers/{owner}[/{name}]/activity` with optional `{"last_activity": ...}`
//! - `POST   /routes/check`

use crate::error::{json_error_response, ErrorCode, ErrorResponse, LifecycleError};
use crate::orchestrator::{Orchestrator, ProgressView, StartOutcome, StopOutcome};
use crate::progress::{ProgressEvent, ProgressSubscription};
use crate::record::ServerKey;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Response body type for every API response, buffered or streamed
pub type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

fn full(body: impl Into<Bytes>) -> ApiBody {
    Full::new(body.into()).boxed_unsync()
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<ApiBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<ApiBody> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = response(status, bytes);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => json_error_response(ErrorCode::InternalError, format!("failed to encode response: {}", e)),
    }
}

struct ApiState {
    orchestrator: Arc<Orchestrator>,
    auth_token: String,
    keepalive_interval: Duration,
}

/// API server fronting the orchestrator
pub struct ApiServer {
    bind_addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(ApiState {
                orchestrator,
                auth_token,
                keepalive_interval: Duration::from_secs(10),
            }),
            shutdown_rx,
        }
    }

    /// Interval between `:keepalive` frames on progress streams
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.keepalive_interval = interval;
        }
        self
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, state: Arc<ApiState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request(req, state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Accept "Bearer <token>", "token <token>" and the bare token
            auth.strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("token "))
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Sub-resource of a server path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerResource {
    Record,
    Progress,
    Activity,
}

/// Parse the part of a path after `/servers/` into a key and sub-resource
fn parse_server_path(rest: &str) -> Option<(ServerKey, ServerResource)> {
    let segments: Vec<String> = rest
        .trim_end_matches('/')
        .split('/')
        .map(|s| urlencoding::decode(s).map(|s| s.into_owned()))
        .collect::<Result<_, _>>()
        .ok()?;

    let resource = |s: &str| match s {
        "progress" => Some(ServerResource::Progress),
        "activity" => Some(ServerResource::Activity),
        _ => None,
    };

    match segments.as_slice() {
        [owner] if !owner.is_empty() => Some((ServerKey::default_server(owner.as_str()), ServerResource::Record)),
        [owner, second] if !owner.is_empty() => match resource(second) {
            Some(sub) => Some((ServerKey::default_server(owner.as_str()), sub)),
            None => Some((ServerKey::new(owner.as_str(), second.as_str()), ServerResource::Record)),
        },
        [owner, name, third] if !owner.is_empty() => {
            resource(third).map(|sub| (ServerKey::new(owner.as_str(), name.as_str()), sub))
        }
        _ => None,
    }
}

async fn handle_request(req: Request<Incoming>, state: Arc<ApiState>) -> Response<ApiBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            return json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                }),
            )
        }
        _ => {}
    }

    if !check_auth(&req, &state.auth_token) {
        warn!(%method, %path, "Unauthorized API request");
        return json_error_response(ErrorCode::Unauthorized, "missing or invalid API token");
    }

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/servers") | (&Method::GET, "/servers/") => {
            Ok(json_response(StatusCode::OK, &state.orchestrator.list_records()))
        }
        (&Method::POST, "/routes/check") => state
            .orchestrator
            .check_routes()
            .await
            .map(|report| json_response(StatusCode::OK, &report)),
        (_, p) if p.starts_with("/servers/") => match parse_server_path(&p["/servers/".len()..]) {
            Some((key, resource)) => handle_server(req, &state, key, resource).await,
            None => Err(LifecycleError::NotFound(path.clone())),
        },
        _ => Err(LifecycleError::NotFound(path.clone())),
    };

    result.unwrap_or_else(|e| {
        debug!(%method, %path, error = %e, "API request failed");
        e.into_response()
    })
}

async fn handle_server(
    req: Request<Incoming>,
    state: &ApiState,
    key: ServerKey,
    resource: ServerResource,
) -> Result<Response<ApiBody>, LifecycleError> {
    let orch = &state.orchestrator;

    match (req.method().clone(), resource) {
        (Method::GET, ServerResource::Record) => {
            let record = orch.get_record(&key.owner, &key.name)?;
            Ok(json_response(StatusCode::OK, &record))
        }

        (Method::POST, ServerResource::Record) => {
            let options: serde_json::Value = read_json(req).await?.unwrap_or_else(|| serde_json::json!({}));
            match orch.request_start(&key.owner, &key.name, options).await? {
                StartOutcome::Ready { url } => Ok(json_response(
                    StatusCode::CREATED,
                    &serde_json::json!({ "status": "ready", "url": url }),
                )),
                StartOutcome::Pending => Ok(json_response(
                    StatusCode::ACCEPTED,
                    &serde_json::json!({
                        "status": "pending",
                        "progress_url": progress_url(&key),
                    }),
                )),
                StartOutcome::AlreadyPending => Ok(already_pending_response(&key)),
            }
        }

        (Method::DELETE, ServerResource::Record) => {
            let body: StopRequest = read_json(req).await?.unwrap_or_default();
            match orch.request_stop(&key.owner, &key.name, body.remove).await? {
                StopOutcome::Stopped => Ok(response(StatusCode::NO_CONTENT, Bytes::new())),
                StopOutcome::Pending => Ok(json_response(
                    StatusCode::ACCEPTED,
                    &serde_json::json!({ "status": "pending" }),
                )),
            }
        }

        (Method::GET, ServerResource::Progress) => {
            let view = orch.subscribe_progress(&key.owner, &key.name)?;
            Ok(progress_response(view, state.keepalive_interval))
        }

        (Method::POST, ServerResource::Activity) => {
            let body: ActivityRequest = read_json(req).await?.unwrap_or_default();
            let at = body.last_activity.unwrap_or_else(Utc::now);
            let updated = orch.record_activity(&key.owner, &key.name, at)?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({ "updated": updated })))
        }

        (method, _) => Err(LifecycleError::InvalidRequest(format!(
            "{} is not supported on this resource",
            method
        ))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    #[serde(default)]
    remove: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ActivityRequest {
    last_activity: Option<DateTime<Utc>>,
}

/// Parse an optional JSON body. An empty body yields `None`.
async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<Option<T>, LifecycleError> {
    let body = req
        .collect()
        .await
        .map_err(|e| LifecycleError::InvalidRequest(format!("failed to read body: {}", e)))?
        .to_bytes();

    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| LifecycleError::InvalidRequest(format!("invalid JSON body: {}", e)))
}

fn progress_url(key: &ServerKey) -> String {
    let mut url = format!("/servers/{}", urlencoding::encode(&key.owner));
    if !key.is_default() {
        url.push('/');
        url.push_str(&urlencoding::encode(&key.name));
    }
    url.push_str("/progress");
    url
}

/// A start is already in flight. Reported as a client error so callers can tell it from a conflict.
fn already_pending_response(key: &ServerKey) -> Response<ApiBody> {
    let code = ErrorCode::SpawnPending;
    let error = ErrorResponse {
        code,
        message: format!("{}: server start is already pending, follow {}", key, progress_url(key)),
        status: StatusCode::BAD_REQUEST.as_u16(),
    };
    let mut response = response(StatusCode::BAD_REQUEST, error.to_json());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-spawnhub-error", HeaderValue::from_static(code.as_header_value()));
    response
}

fn sse_frame(event: &ProgressEvent) -> Frame<Bytes> {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Frame::data(Bytes::from(format!("data: {}\n\n", json)))
}

fn keepalive_frame() -> Frame<Bytes> {
    Frame::data(Bytes::from_static(b":keepalive\n\n"))
}

/// Server-sent event stream of progress events, closed after the terminal event
fn progress_response(view: ProgressView, keepalive_interval: Duration) -> Response<ApiBody> {
    let frames: BoxStream<'static, Result<Frame<Bytes>, Infallible>> = match view {
        ProgressView::Finished(event) => stream::once(async move { Ok(sse_frame(&event)) }).boxed(),
        ProgressView::Live(subscription) => live_frames(subscription, keepalive_interval).boxed(),
    };

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Dropping the stream (client gone) ends the keepalive loop with it
fn live_frames(
    subscription: ProgressSubscription,
    keepalive_interval: Duration,
) -> impl futures::Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + 'static {
    let period = keepalive_interval.max(Duration::from_millis(10));
    let keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    stream::unfold(Some((subscription, keepalive)), |state| async move {
        let (mut subscription, mut keepalive) = state?;
        tokio::select! {
            event = subscription.recv() => {
                let event = event?;
                let next = if event.is_terminal() { None } else { Some((subscription, keepalive)) };
                Some((Ok(sse_frame(&event)), next))
            }
            _ = keepalive.tick() => Some((Ok(keepalive_frame()), Some((subscription, keepalive)))),
        }
    })
}
