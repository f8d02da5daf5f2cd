//! Forwarding handles: relay one request/response cycle to a fixed backend
//!
//! A [`ProxyFactory`] owns the pooled HTTP client shared by every handle it
//! builds. Handles are cheap to hold and are cached per virtual host by the
//! registry, so connections to a backend are reused across requests.

use crate::error::{BoxError, ForwardError, RegistryError, RequestReadTimeout};
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;
use tracing::debug;

/// Body type accepted by forwarding handles
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Body type produced by forwarding handles
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Token this proxy adds to the Via header
const VIA_PSEUDONYM: &str = env!("CARGO_PKG_NAME");

/// Headers that apply to a single connection and are never relayed
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Statistics shared by a factory and the handles it built
#[derive(Debug, Default)]
pub struct FactoryStats {
    /// Number of forwarding handles constructed
    pub handles_built: AtomicU64,
    /// Number of requests relayed to any backend
    pub requests_forwarded: AtomicU64,
}

impl FactoryStats {
    pub fn record_build(&self) {
        self.handles_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_handles_built(&self) -> u64 {
        self.handles_built.load(Ordering::Relaxed)
    }

    pub fn get_requests_forwarded(&self) -> u64 {
        self.requests_forwarded.load(Ordering::Relaxed)
    }
}

/// Configuration for the backend connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Builds forwarding handles bound to a backend base URL
pub struct ProxyFactory {
    client: Client<HttpConnector, RequestBody>,
    stats: Arc<FactoryStats>,
}

impl ProxyFactory {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(FactoryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FactoryStats> {
        Arc::clone(&self.stats)
    }

    /// Create a handle for `backend_url`. No network I/O happens here.
    pub fn build(&self, backend_url: &str) -> Result<ForwardingHandle, RegistryError> {
        let target = BackendTarget::parse(backend_url)?;
        self.stats.record_build();
        debug!(backend = %backend_url, "Forwarding handle created");

        Ok(ForwardingHandle {
            target,
            client: self.client.clone(),
            stats: Arc::clone(&self.stats),
        })
    }
}

impl Default for ProxyFactory {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Parsed backend base URL
#[derive(Debug, Clone, PartialEq, Eq)]
struct BackendTarget {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
}

impl BackendTarget {
    fn parse(url: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::BackendUrlInvalid {
            url: url.to_string(),
            reason,
        };

        let uri: Uri = url.trim().parse().map_err(|e| invalid(format!("{}", e)))?;

        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| invalid("URL is not absolute (missing scheme)".to_string()))?;
        if scheme != Scheme::HTTP {
            return Err(invalid(format!("unsupported scheme '{}'", scheme)));
        }

        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("URL has no host".to_string()))?;
        if authority.host().is_empty() {
            return Err(invalid("URL has no host".to_string()));
        }

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().to_string(),
            base_query: uri.query().filter(|q| !q.is_empty()).map(String::from),
        })
    }

    /// Target URI for an inbound request path and query
    fn request_uri(&self, path: &str, query: Option<&str>) -> Result<Uri, hyper::http::Error> {
        let path = join_paths(&self.base_path, path);
        let path_and_query = match (self.base_query.as_deref(), query.filter(|q| !q.is_empty())) {
            (Some(base), Some(query)) => format!("{}?{}&{}", path, base, query),
            (Some(q), None) | (None, Some(q)) => format!("{}?{}", path, q),
            (None, None) => path,
        };

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(PathAndQuery::try_from(path_and_query)?)
            .build()
    }
}

/// Join the backend path prefix and the request path with exactly one slash
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Reusable relay bound to one backend
pub struct ForwardingHandle {
    target: BackendTarget,
    client: Client<HttpConnector, RequestBody>,
    stats: Arc<FactoryStats>,
}

impl std::fmt::Debug for ForwardingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingHandle")
            .field("backend", &self.backend())
            .finish()
    }
}

impl ForwardingHandle {
    /// Backend scheme and authority, e.g. `http://10.0.0.1:9000`
    pub fn backend(&self) -> String {
        format!("{}://{}", self.target.scheme, self.target.authority)
    }

    /// Relay `req` to the backend and return its response unmodified
    /// apart from hop-by-hop headers.
    pub async fn forward(
        &self,
        mut req: Request<RequestBody>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<ResponseBody>, ForwardError> {
        let upgrade = upgrade_type(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let uri = self
            .target
            .request_uri(req.uri().path(), req.uri().query())?;

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;

        // HTTP/2 requests carry the host in the URI authority only
        if !headers.contains_key(hyper::header::HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    headers.insert(hyper::header::HOST, value);
                }
            }
        }

        let keep_te_trailers = headers
            .get_all(hyper::header::TE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")));

        remove_hop_by_hop_headers(&mut headers);

        if keep_te_trailers {
            headers.insert(hyper::header::TE, HeaderValue::from_static("trailers"));
        }
        if let Some(ref upgrade) = upgrade {
            headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(hyper::header::UPGRADE, upgrade.clone());
        }

        set_forwarding_headers(&mut headers, client_addr, is_tls, parts.version);

        let mut builder = Request::builder().method(parts.method).uri(uri);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        let backend_req = builder.body(body)?;

        self.stats.record_request();
        let mut response = self.client.request(backend_req).await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let response_upgrade = upgrade_type(response.headers());
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(splice_upgraded(client_upgrade, backend_upgrade, self.backend()));
            }
            remove_hop_by_hop_headers(response.headers_mut());
            if let Some(upgrade) = response_upgrade {
                let headers = response.headers_mut();
                headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("upgrade"));
                headers.insert(hyper::header::UPGRADE, upgrade);
            }
        } else {
            remove_hop_by_hop_headers(response.headers_mut());
        }

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Value of the Upgrade header when the request asks for a protocol switch
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let connection_upgrade = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));

    if connection_upgrade {
        headers.get(hyper::header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Strip hop-by-hop headers, including any named by the Connection header
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Set X-Forwarded-* and append Via.
///
/// X-Forwarded-* values supplied by the client are overwritten; this proxy
/// is assumed to be the first trusted hop.
fn set_forwarding_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    is_tls: bool,
    version: Version,
) {
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    let version = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    };
    if let Ok(value) = HeaderValue::from_str(&format!("{} {}", version, VIA_PSEUDONYM)) {
        headers.append(hyper::header::VIA, value);
    }
}

/// Copy bytes both ways between an upgraded client and backend connection
async fn splice_upgraded(client: OnUpgrade, backend: OnUpgrade, backend_name: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(backend = %backend_name, error = %e, "Upgrade failed");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                backend = %backend_name,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(backend = %backend_name, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Request body that fails once its read deadline passes
pub struct ReadTimeoutBody<B> {
    inner: B,
    deadline: Pin<Box<Sleep>>,
}

impl<B> ReadTimeoutBody<B> {
    pub fn new(inner: B, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }
}

impl<B> Body for ReadTimeoutBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => Poll::Ready(frame.map(|r| r.map_err(Into::into))),
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(Box::new(RequestReadTimeout)))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use std::convert::Infallible;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_factory_stats() {
        let stats = FactoryStats::default();
        assert_eq!(stats.get_handles_built(), 0);

        stats.record_build();
        stats.record_request();
        stats.record_request();
        assert_eq!(stats.get_handles_built(), 1);
        assert_eq!(stats.get_requests_forwarded(), 2);
    }

    #[test]
    fn test_parse_backend_url() {
        let target = BackendTarget::parse("http://10.0.0.1:9000").unwrap();
        assert_eq!(target.scheme, Scheme::HTTP);
        assert_eq!(target.authority.as_str(), "10.0.0.1:9000");
        assert_eq!(target.base_query, None);

        let target = BackendTarget::parse("http://backend.internal/app?tenant=a").unwrap();
        assert_eq!(target.base_path, "/app");
        assert_eq!(target.base_query.as_deref(), Some("tenant=a"));
    }

    #[test]
    fn test_parse_backend_url_rejects_malformed() {
        for url in ["", "not a url", "/relative/path", "10.0.0.1:9000", "ftp://10.0.0.1/", "https://10.0.0.1"] {
            let err = BackendTarget::parse(url).unwrap_err();
            assert!(
                matches!(err, RegistryError::BackendUrlInvalid { .. }),
                "expected {:?} to be rejected",
                url
            );
        }
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/x"), "/x");
        assert_eq!(join_paths("", "/x"), "/x");
        assert_eq!(join_paths("/api", "/x"), "/api/x");
        assert_eq!(join_paths("/api/", "/x"), "/api/x");
        assert_eq!(join_paths("/api", "x"), "/api/x");
    }

    #[test]
    fn test_request_uri() {
        let target = BackendTarget::parse("http://10.0.0.1:9000").unwrap();
        assert_eq!(
            target.request_uri("/x", None).unwrap().to_string(),
            "http://10.0.0.1:9000/x"
        );
        assert_eq!(
            target.request_uri("/search", Some("q=rust")).unwrap().to_string(),
            "http://10.0.0.1:9000/search?q=rust"
        );

        let target = BackendTarget::parse("http://10.0.0.1:9000/base?k=v").unwrap();
        assert_eq!(
            target.request_uri("/x", Some("a=1")).unwrap().to_string(),
            "http://10.0.0.1:9000/base/x?k=v&a=1"
        );
        assert_eq!(
            target.request_uri("/x", None).unwrap().to_string(),
            "http://10.0.0.1:9000/base/x?k=v"
        );
    }

    #[test]
    fn test_remove_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9v"));
        headers.insert("x-session-hop", HeaderValue::from_static("1"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        remove_hop_by_hop_headers(&mut headers);

        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(!headers.contains_key("proxy-authorization"));
        assert!(!headers.contains_key("x-session-hop"));
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn test_upgrade_type() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert_eq!(upgrade_type(&headers), None);

        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_type(&headers).unwrap(), "websocket");
    }

    #[test]
    fn test_forwarding_headers_overwrite_client_values() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("a.example:80"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("6.6.6.6"));
        headers.insert("via", HeaderValue::from_static("1.0 upstream"));

        let client: SocketAddr = "192.0.2.7:50123".parse().unwrap();
        set_forwarding_headers(&mut headers, client, true, Version::HTTP_11);

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.0.2.7");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "a.example:80");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");

        let via: Vec<_> = headers.get_all("via").iter().collect();
        assert_eq!(via.len(), 2);
        assert_eq!(via[1], "1.1 reprox");
    }

    #[test]
    fn test_build_performs_no_io_and_counts() {
        let factory = ProxyFactory::default();
        // Nothing listens here; construction must still succeed.
        let handle = factory.build("http://192.0.2.1:9").unwrap();
        assert_eq!(handle.backend(), "http://192.0.2.1:9");
        assert_eq!(factory.stats().get_handles_built(), 1);

        assert!(factory.build("::bad::").is_err());
        assert_eq!(factory.stats().get_handles_built(), 1);
    }

    #[tokio::test]
    async fn test_read_timeout_body_passes_complete_body() {
        let body = ReadTimeoutBody::new(Full::new(Bytes::from_static(b"hello")), Duration::from_secs(5));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello"));
    }

    /// A client body that never sends anything
    struct StalledBody;

    impl Body for StalledBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_read_timeout_body_fails_on_stalled_client() {
        let body = ReadTimeoutBody::new(StalledBody, Duration::from_millis(50));

        let err = body.collect().await.unwrap_err();
        assert!(err.is::<RequestReadTimeout>());
    }
}
