//! Error taxonomy for dev server orchestration and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Failures surfaced by the port allocator, the container and route managers
/// and the orchestrator that composes them
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No free window left in the searchable port range
    #[error("no free port window within {searched} ports of {base_port}")]
    NoCapacity { base_port: u16, searched: u32 },

    /// Requested port is taken, or requested twice
    #[error("port conflict: {0}")]
    PortConflict(String),

    /// Requested port lies outside 1024..=65535
    #[error("port {0} is outside the allowed range 1024-65535")]
    InvalidPort(u32),

    #[error("container start failed: {0}")]
    ContainerStart(String),

    #[error("proxy route creation failed: {0}")]
    ProxyCreate(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Project configuration store rejected a write
    #[error("persistence failed: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoCapacity { .. } => ErrorCode::NoCapacity,
            Error::PortConflict(_) => ErrorCode::PortConflict,
            Error::InvalidPort(_) => ErrorCode::InvalidPort,
            Error::ContainerStart(_) => ErrorCode::ContainerStartFailed,
            Error::ProxyCreate(_) => ErrorCode::ProxyCreateFailed,
            Error::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            Error::UserNotFound(_) => ErrorCode::UserNotFound,
            Error::Persistence(_) => ErrorCode::PersistenceFailed,
        }
    }

    /// Message safe to show to end users. Container and route internals are
    /// logged, never returned.
    pub fn public_message(&self) -> String {
        match self {
            Error::ContainerStart(_) => "failed to start dev server".to_string(),
            Error::ProxyCreate(_) => "failed to create custom domain".to_string(),
            Error::Persistence(_) => "failed to save project configuration".to_string(),
            other => other.to_string(),
        }
    }
}

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoCapacity,
    PortConflict,
    InvalidPort,
    ContainerStartFailed,
    ProxyCreateFailed,
    ProjectNotFound,
    UserNotFound,
    PersistenceFailed,
    /// Malformed request body or parameters
    BadRequest,
    Unauthorized,
    NotFound,
    /// Missing Host header on a proxied request
    MissingHostHeader,
    /// No route for the requested host
    UnknownHost,
    /// Dev server did not answer within the request timeout
    RequestTimeout,
    /// Could not reach the dev server
    ConnectionFailed,
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::PortConflict => StatusCode::CONFLICT,
            ErrorCode::InvalidPort => StatusCode::BAD_REQUEST,
            ErrorCode::ContainerStartFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::ProxyCreateFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::ProjectNotFound => StatusCode::NOT_FOUND,
            ErrorCode::UserNotFound => StatusCode::NOT_FOUND,
            ErrorCode::PersistenceFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The code as sent in the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::NoCapacity => "NO_CAPACITY",
            ErrorCode::PortConflict => "PORT_CONFLICT",
            ErrorCode::InvalidPort => "INVALID_PORT",
            ErrorCode::ContainerStartFailed => "CONTAINER_START_FAILED",
            ErrorCode::ProxyCreateFailed => "PROXY_CREATE_FAILED",
            ErrorCode::ProjectNotFound => "PROJECT_NOT_FOUND",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::PersistenceFailed => "PERSISTENCE_FAILED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ErrorCode::UnknownHost => "UNKNOWN_HOST",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
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

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        ErrorResponse::new(err.code(), err.public_message())
    }
}

/// JSON error response carrying the code in X-Proxy-Error
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::NoCapacity.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::PortConflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::InvalidPort.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::RequestTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_public_message_hides_internals() {
        let err = Error::ContainerStart("docker: container abc123 exited with 137".into());
        assert_eq!(err.public_message(), "failed to start dev server");

        let err = Error::ProxyCreate("route table timeout for alice-app.localhost".into());
        assert_eq!(err.public_message(), "failed to create custom domain");
        assert!(!err.public_message().contains("alice"));
    }

    #[test]
    fn test_error_maps_to_code() {
        let err = Error::NoCapacity { base_port: 5200, searched: 10_000 };
        assert_eq!(err.code(), ErrorCode::NoCapacity);
        assert!(err.to_string().contains("5200"));

        assert_eq!(Error::InvalidPort(80).code(), ErrorCode::InvalidPort);
        assert_eq!(
            Error::ProjectNotFound("p1".into()).code().status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_response_json() {
        let err = Error::PortConflict("port 5200 is already allocated".into());
        let json = ErrorResponse::from(&err).to_json();

        assert!(json.contains("\"code\":\"PORT_CONFLICT\""));
        assert!(json.contains("5200"));
        assert!(json.contains("\"status\":409"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ErrorCode::UnknownHost, "no dev server for host");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UNKNOWN_HOST"
        );
    }
}
