//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors returned when resolving or launching an app
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    /// The registry has no entry for this name
    #[error("unknown app '{0}'")]
    UnknownApp(String),

    /// The process could not be spawned or exited before becoming ready
    #[error("app '{name}' failed to start: {reason}")]
    StartFailure {
        name: String,
        reason: String,
        output: Vec<String>,
    },

    /// The process did not accept connections within the startup timeout
    #[error("app '{name}' did not become ready within {}s", timeout.as_secs_f64())]
    StartTimeout {
        name: String,
        timeout: Duration,
        output: Vec<String>,
    },
}

impl AppError {
    /// Captured stdout/stderr tail, if the error came from a launch attempt
    pub fn output(&self) -> &[String] {
        match self {
            AppError::UnknownApp(_) => &[],
            AppError::StartFailure { output, .. } | AppError::StartTimeout { output, .. } => output,
        }
    }

    /// Error code used when rendering this error as an HTTP response
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::UnknownApp(_) => ErrorCode::UnknownApp,
            AppError::StartFailure { .. } | AppError::StartTimeout { .. } => ErrorCode::AppStartFailed,
        }
    }
}

/// Errors while relaying a request to a running app
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The connection to the app broke
    #[error("app connection failed: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP client could not complete the exchange
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// The app sent something that is not valid HTTP
    #[error("invalid response from app: {0}")]
    Protocol(String),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or malformed Host header
    MissingHost,
    /// No app matches the requested host
    UnknownApp,
    /// The app could not be started
    AppStartFailed,
    /// Failed to reach the app once it was running
    ConnectionFailed,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingHost => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ErrorCode::AppStartFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value for the X-Devgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingHost => "MISSING_HOST",
            ErrorCode::UnknownApp => "UNKNOWN_APP",
            ErrorCode::AppStartFailed => "APP_START_FAILED",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
    /// App output tail, only present in debug mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: Vec<String>) -> Self {
        self.output = Some(output);
        self
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

    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = self.code.status_code();
        let header = self.code.as_header_value();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("X-Devgate-Error", header)
            .body(Full::new(Bytes::from(self.to_json())).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Devgate-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    ErrorResponse::new(code, message).into_response()
}

/// Render an app resolution error. Output is only exposed when `debug` is set.
pub fn app_error_response(err: &AppError, debug: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
    let response = match err {
        AppError::UnknownApp(name) => {
            ErrorResponse::new(err.code(), format!("No app named '{}' is configured", name))
        }
        _ if debug => ErrorResponse::new(err.code(), err.to_string()).with_output(err.output().to_vec()),
        _ => ErrorResponse::new(err.code(), "App failed to start"),
    };
    response.into_response()
}
