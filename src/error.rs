//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;

/// Boxed error used for request bodies flowing to a backend
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while resolving a host to its forwarding handle
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The host has no entry in the routing table
    #[error("Backend server {0:?} not found")]
    UnknownHost(String),

    /// The configured backend URL is not an absolute http URL
    #[error("Invalid backend URL {url:?}: {reason}")]
    BackendUrlInvalid { url: String, reason: String },
}

/// Errors raised while relaying a request to a backend
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The outgoing request could not be assembled
    #[error("Request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),

    /// The backend could not be reached or failed mid-exchange
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

impl ForwardError {
    /// True when the failure was caused by the client body missing its read deadline
    pub fn is_request_read_timeout(&self) -> bool {
        caused_by_read_timeout(self)
    }
}

fn caused_by_read_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(err) = source {
        if err.is::<RequestReadTimeout>() {
            return true;
        }
        source = err.source();
    }
    false
}

/// The client did not finish sending its request body in time
#[derive(Debug, Error)]
#[error("request body not received within the read timeout")]
pub struct RequestReadTimeout;

/// Listener lifecycle errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Address in use, permission denied, ...
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Certificate, key or protocol policy could not be applied
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A connection task failed while draining
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Unknown or unconfigured host
    UnknownHost,
    /// Backend configuration error
    BackendConfigError,
    /// Client did not send its request in time
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::BackendConfigError => "BACKEND_CONFIG_ERROR",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

impl From<&RegistryError> for ProxyErrorCode {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::UnknownHost(_) => ProxyErrorCode::UnknownHost,
            RegistryError::BackendUrlInvalid { .. } => ProxyErrorCode::BackendConfigError,
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
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::BackendConfigError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_registry_error_maps_to_code() {
        let unknown = RegistryError::UnknownHost("c.example:80".to_string());
        assert_eq!(ProxyErrorCode::from(&unknown), ProxyErrorCode::UnknownHost);

        let invalid = RegistryError::BackendUrlInvalid {
            url: "::nope".to_string(),
            reason: "missing scheme".to_string(),
        };
        assert_eq!(
            ProxyErrorCode::from(&invalid),
            ProxyErrorCode::BackendConfigError
        );
    }

    #[test]
    fn test_unknown_host_message_names_host() {
        let err = RegistryError::UnknownHost("c.example:80".to_string());
        assert_eq!(err.to_string(), r#"Backend server "c.example:80" not found"#);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownHost, "Host not found: example.com");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"Host not found: example.com\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "CONNECTION_FAILED"
        );
    }

    #[test]
    fn test_request_read_timeout_detected_through_source_chain() {
        #[derive(Debug, Error)]
        #[error("wrapper")]
        struct Wrapper(#[source] RequestReadTimeout);

        assert!(caused_by_read_timeout(&Wrapper(RequestReadTimeout)));
        assert!(caused_by_read_timeout(&RequestReadTimeout));

        let unrelated = std::io::Error::new(std::io::ErrorKind::Other, "reset");
        assert!(!caused_by_read_timeout(&unrelated));
    }
}
