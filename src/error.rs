//! Error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure querying the OS process table.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No backend processes matched the process name.
    #[error("no matching backend processes found")]
    NotFound,
    /// The query itself failed (permissions, transient OS error).
    #[error("process table query failed: {0}")]
    Query(String),
}

/// A candidate process lacked a required credential field.
///
/// Non-fatal: the candidate is dropped and the rest of the scan proceeds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("command line is missing required field `{0}`")]
    MissingField(&'static str),
}

/// An endpoint socket could not be provisioned. The corresponding Added
/// event is effectively dropped; the user stays known but unserved until
/// the next churn cycle.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to bind proxy socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Error codes for request-level proxy failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No credential (or no backend socket path) is known for this endpoint
    CredentialMissing,
    /// Backend socket is missing or the dial failed
    UpstreamUnavailable,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::CredentialMissing => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::CredentialMissing => "CREDENTIAL_MISSING",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
