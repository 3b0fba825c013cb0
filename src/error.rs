//! Lifecycle errors and their JSON error responses

use crate::api::ApiBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;

/// Which in-flight or settled state a request collided with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Server is already running
    AlreadyRunning,
    /// A start is in flight for this server
    SpawnPending,
    /// A stop is in flight for this server
    StopPending,
    /// Server is neither running nor starting
    NotRunning,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConflictKind::AlreadyRunning => "server is already running",
            ConflictKind::SpawnPending => "server start is pending, please wait for it to finish",
            ConflictKind::StopPending => "server stop is pending, please wait",
            ConflictKind::NotRunning => "server is not running",
        };
        f.write_str(msg)
    }
}

/// Errors surfaced by the lifecycle orchestrator.
///
/// Every variant owns its data so the error can be cloned out of a
/// memoized background operation to each caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("too many servers starting, try again in {retry_after_secs} seconds")]
    Throttled { retry_after_secs: u64 },

    #[error("active server limit exceeded ({active}/{limit}), try again in a few minutes")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("{server}: {kind}")]
    Conflict { server: String, kind: ConflictKind },

    #[error("backend failed: {0}")]
    Provisioner(String),

    #[error("route table update failed: {0}")]
    RouteSync(String),

    #[error("no such server: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("record store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    pub fn conflict(server: impl fmt::Display, kind: ConflictKind) -> Self {
        LifecycleError::Conflict {
            server: server.to_string(),
            kind,
        }
    }

    /// Stable error code for API responses
    pub fn code(&self) -> ErrorCode {
        match self {
            LifecycleError::Throttled { .. } => ErrorCode::Throttled,
            LifecycleError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            LifecycleError::Conflict { kind, .. } => match kind {
                ConflictKind::AlreadyRunning => ErrorCode::AlreadyRunning,
                ConflictKind::SpawnPending => ErrorCode::SpawnPending,
                ConflictKind::StopPending => ErrorCode::StopPending,
                ConflictKind::NotRunning => ErrorCode::NotRunning,
            },
            LifecycleError::Provisioner(_) => ErrorCode::ProvisionerFailed,
            LifecycleError::RouteSync(_) => ErrorCode::RouteSyncFailed,
            LifecycleError::NotFound(_) => ErrorCode::NotFound,
            LifecycleError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            LifecycleError::Store(_) | LifecycleError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Convert into a JSON error response, adding `Retry-After` when throttled
    pub fn into_response(self) -> Response<ApiBody> {
        let retry_after = match &self {
            LifecycleError::Throttled { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let mut response = json_error_response(self.code(), self.to_string());
        if let Some(secs) = retry_after {
            response.headers_mut().insert(RETRY_AFTER, secs.into());
        }
        response
    }
}

impl From<anyhow::Error> for LifecycleError {
    fn from(err: anyhow::Error) -> Self {
        LifecycleError::Store(format!("{:#}", err))
    }
}

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Too many concurrent starts
    Throttled,
    /// Active server ceiling reached
    CapacityExceeded,
    /// Start requested for a running server
    AlreadyRunning,
    /// Request collided with an in-flight start
    SpawnPending,
    /// Request collided with an in-flight stop
    StopPending,
    /// Server is not running
    NotRunning,
    /// Backend failed to start or stop
    ProvisionerFailed,
    /// Proxy route update failed after retries
    RouteSyncFailed,
    /// Unknown server or path
    NotFound,
    /// Malformed request
    InvalidRequest,
    /// Missing or wrong API token
    Unauthorized,
    /// Internal error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::AlreadyRunning => StatusCode::CONFLICT,
            ErrorCode::SpawnPending => StatusCode::CONFLICT,
            ErrorCode::StopPending => StatusCode::CONFLICT,
            ErrorCode::NotRunning => StatusCode::BAD_REQUEST,
            ErrorCode::ProvisionerFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::RouteSyncFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Spawnhub-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Throttled => "THROTTLED",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::SpawnPending => "SPAWN_PENDING",
            ErrorCode::StopPending => "STOP_PENDING",
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::ProvisionerFailed => "PROVISIONER_FAILED",
            ErrorCode::RouteSyncFailed => "ROUTE_SYNC_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Spawnhub-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<ApiBody> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(Full::new(Bytes::from(error.to_json())).boxed_unsync());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-spawnhub-error", HeaderValue::from_static(code.as_header_value()));
    response
}
