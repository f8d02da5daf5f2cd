//! Listener lifecycle: bind, serve, drain, close
//!
//! Each listener moves through `Created -> Listening -> Draining -> Closed`.
//! Draining starts when the shared shutdown channel fires: the socket is
//! closed so new connections are refused, live connections are asked to
//! finish their current request, and anything still running when the drain
//! deadline passes is aborted.

use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::shutdown::wait_for_shutdown;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Observable lifecycle state of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Listening,
    Draining,
    Closed,
}

/// Slow-client and shutdown bounds for a listener
#[derive(Debug, Clone)]
pub struct ServerTimeouts {
    /// Time allowed for the TLS handshake and for each request's headers
    pub header_read: Duration,
    /// Time allowed for in-flight requests after shutdown starts
    pub drain: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            header_read: Duration::from_secs(10),
            drain: Duration::from_secs(10),
        }
    }
}

/// One listening endpoint, plain or TLS
pub struct ProxyServer {
    name: String,
    bind_addr: SocketAddr,
    dispatcher: Dispatcher,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    timeouts: ServerTimeouts,
    state: watch::Sender<ListenerState>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Dispatcher,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Created);
        Self {
            name: "http".to_string(),
            bind_addr,
            dispatcher,
            shutdown_rx,
            tls_acceptor: None,
            timeouts: ServerTimeouts::default(),
            state,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self.name = "https".to_string();
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.bind_addr,
            source,
        })?;

        self.state.send_replace(ListenerState::Listening);
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(
            listener = %self.name,
            addr = %local_addr,
            protocol,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        Ok(BoundServer {
            listener,
            local_addr,
            server: self,
        })
    }
}

/// A listener whose socket is open and ready to serve
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    server: ProxyServer,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.server.state()
    }

    /// Accept connections until shutdown, then drain and close
    pub async fn serve(self) -> Result<(), ServerError> {
        let BoundServer {
            listener,
            local_addr,
            server,
        } = self;

        let builder = connection_builder(&server.timeouts);
        let mut shutdown_rx = server.shutdown_rx.clone();
        let mut connections = JoinSet::new();
        let mut failures = 0usize;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            connections.spawn(serve_connection(
                                stream,
                                addr,
                                server.tls_acceptor.clone(),
                                server.dispatcher.clone(),
                                builder.clone(),
                                server.shutdown_rx.clone(),
                                server.timeouts.header_read,
                            ));
                        }
                        Err(e) => {
                            error!(listener = %server.name, error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    failures += count_failure(&server.name, finished);
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    break;
                }
            }
        }

        // Closing the socket refuses new connections
        drop(listener);
        server.state.send_replace(ListenerState::Draining);
        info!(
            listener = %server.name,
            addr = %local_addr,
            in_flight = connections.len(),
            drain_timeout_secs = server.timeouts.drain.as_secs_f64(),
            "Listener closed, draining connections"
        );

        let drained = tokio::time::timeout(server.timeouts.drain, async {
            let mut failures = 0usize;
            while let Some(finished) = connections.join_next().await {
                failures += count_failure(&server.name, finished);
            }
            failures
        })
        .await;

        match drained {
            Ok(drain_failures) => failures += drain_failures,
            Err(_) => {
                warn!(
                    listener = %server.name,
                    remaining = connections.len(),
                    "Drain deadline elapsed, aborting remaining connections"
                );
                connections.shutdown().await;
            }
        }

        server.state.send_replace(ListenerState::Closed);
        info!(listener = %server.name, addr = %local_addr, "Proxy server closed");

        if failures > 0 {
            return Err(ServerError::Shutdown(format!(
                "{} connection task(s) on {} failed",
                failures, server.name
            )));
        }
        Ok(())
    }
}

fn connection_builder(timeouts: &ServerTimeouts) -> AutoBuilder<TokioExecutor> {
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.header_read)
        .preserve_header_case(true);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(timeouts.header_read))
        .keep_alive_timeout(timeouts.header_read)
        .max_concurrent_streams(250);
    builder
}

/// 1 if a connection task panicked, 0 otherwise
fn count_failure(listener: &str, finished: Result<(), JoinError>) -> usize {
    match finished {
        Ok(()) => 0,
        Err(e) if e.is_cancelled() => 0,
        Err(e) => {
            error!(listener, error = %e, "Connection task failed");
            1
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    dispatcher: Dispatcher,
    builder: AutoBuilder<TokioExecutor>,
    shutdown_rx: watch::Receiver<bool>,
    header_read: Duration,
) {
    let result = match tls_acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(header_read, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    drive_connection(
                        tls_stream,
                        addr,
                        true,
                        dispatcher,
                        builder,
                        shutdown_rx,
                        header_read,
                    )
                    .await
                }
                Ok(Err(e)) => {
                    debug!(addr = %addr, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(addr = %addr, "TLS handshake timed out");
                    return;
                }
            }
        }
        None => {
            drive_connection(stream, addr, false, dispatcher, builder, shutdown_rx, header_read)
                .await
        }
    };

    if let Err(e) = result {
        debug!(addr = %addr, error = %e, "Connection error");
    }
}

async fn drive_connection<S>(
    stream: S,
    addr: SocketAddr,
    is_tls: bool,
    dispatcher: Dispatcher,
    builder: AutoBuilder<TokioExecutor>,
    mut shutdown_rx: watch::Receiver<bool>,
    header_read: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    // Set once the first request reaches the service
    let request_seen = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&request_seen);

    let service = service_fn(move |req: Request<Incoming>| {
        seen.store(true, Ordering::Release);
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.handle(req, addr, is_tls).await) }
    });

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    // Protocol detection and the HTTP/2 preface are not covered by hyper's
    // HTTP/1 header timeout, so the first request has its own deadline.
    let first_request_deadline = tokio::time::sleep(header_read);
    tokio::pin!(first_request_deadline);
    let mut awaiting_first_request = true;

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => return result,
            _ = first_request_deadline.as_mut(), if awaiting_first_request => {
                awaiting_first_request = false;
                if !request_seen.load(Ordering::Acquire) {
                    debug!(addr = %addr, timeout_secs = header_read.as_secs_f64(), "No request received in time, closing connection");
                    return Ok(());
                }
            }
            _ = wait_for_shutdown(&mut shutdown_rx), if !draining => {
                // Finish the in-flight request, then close
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    }
}
