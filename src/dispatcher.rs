//! Request entry point: host -> registry -> forwarding handle

use crate::error::{json_error_response, ProxyErrorCode, RegistryError};
use crate::forward::{ReadTimeoutBody, ResponseBody};
use crate::registry::Registry;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Default time allowed for reading a request body
const DEFAULT_REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes requests to backends by their host. Holds no per-request state.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    request_read_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            request_read_timeout: DEFAULT_REQUEST_READ_TIMEOUT,
        }
    }

    /// Bound the time a client may take to send its request body
    pub fn with_request_read_timeout(mut self, timeout: Duration) -> Self {
        self.request_read_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one request. Always produces a response; routing and backend
    /// failures become JSON error responses.
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ResponseBody> {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }

        let host = match request_host(&req) {
            Some(host) => host,
            None => {
                warn!(request_id, client = %client_addr, "Request without host");
                return json_error_response(
                    ProxyErrorCode::MissingHostHeader,
                    "Missing or invalid Host header",
                );
            }
        };

        debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let handle = match self.registry.get_or_create_handle(&host).await {
            Ok(handle) => handle,
            Err(e @ RegistryError::UnknownHost(_)) => {
                warn!(host, request_id, "Backend server not found");
                return json_error_response(ProxyErrorCode::from(&e), e.to_string());
            }
            Err(e @ RegistryError::BackendUrlInvalid { .. }) => {
                // Detailed reason is logged, not returned
                error!(host, request_id, error = %e, "Backend configuration error");
                return json_error_response(ProxyErrorCode::from(&e), "Internal Server Error");
            }
        };

        let timeout = self.request_read_timeout;
        let req = req.map(|body| ReadTimeoutBody::new(body, timeout).boxed_unsync());

        match handle.forward(req, client_addr, is_tls).await {
            Ok(response) => response,
            Err(e) if e.is_request_read_timeout() => {
                warn!(host, request_id, timeout_secs = timeout.as_secs(), "Request body read timed out");
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request body not received within {} seconds", timeout.as_secs()),
                )
            }
            Err(e) => {
                error!(host, backend = %handle.backend(), request_id, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
        }
    }
}

/// Literal host of the request: the Host header, or the URI authority
/// for HTTP/2. The port is kept.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    Some(host.to_string())
}
