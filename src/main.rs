use reprox::config::Config;
use reprox::dispatcher::Dispatcher;
use reprox::forward::{PoolConfig, ProxyFactory};
use reprox::registry::Registry;
use reprox::server::{ProxyServer, ServerTimeouts};
use reprox::shutdown::{Shutdown, SignalListener};
use reprox::tls::{self, TlsPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("reprox=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("reprox.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let factory = ProxyFactory::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    });
    let registry = Arc::new(Registry::new(config.backends.clone(), factory));
    let dispatcher = Dispatcher::new(Arc::clone(&registry))
        .with_request_read_timeout(config.server.request_read_timeout());

    let timeouts = ServerTimeouts {
        header_read: config.server.header_read_timeout(),
        drain: config.server.shutdown_timeout(),
    };

    let shutdown = Shutdown::new();
    let mut servers = Vec::new();

    if let Some(addr) = config.server.http_listen_addr()? {
        servers.push(
            ProxyServer::new(addr, dispatcher.clone(), shutdown.subscribe())
                .with_timeouts(timeouts.clone()),
        );
    }

    match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => {
            if let Some(addr) = config.server.https_listen_addr()? {
                let policy = TlsPolicy::from_config(&config.server)?;
                let acceptor = tls::load_acceptor(cert, key, &policy).map_err(|e| {
                    error!(error = %e, "Failed to configure TLS");
                    e
                })?;
                servers.push(
                    ProxyServer::new(addr, dispatcher.clone(), shutdown.subscribe())
                        .with_tls(acceptor)
                        .with_timeouts(timeouts.clone()),
                );
            }
        }
        _ => info!("No TLS certificate configured, HTTPS listener disabled"),
    }

    if servers.is_empty() {
        anyhow::bail!("No listeners configured: set http_addr, or tls_cert and tls_key");
    }

    // Bind everything before serving so a port conflict stops startup
    let mut bound = Vec::with_capacity(servers.len());
    for server in servers {
        let server = server.bind().await.map_err(|e| {
            error!(error = %e, "Failed to start listener");
            e
        })?;
        bound.push(server);
    }

    // Handlers go in before any listener serves
    let mut signals = SignalListener::register().map_err(|e| {
        error!(error = %e, "Failed to install signal handlers");
        e
    })?;

    let handles: Vec<_> = bound
        .into_iter()
        .map(|server| tokio::spawn(server.serve()))
        .collect();

    let signal = signals.recv().await;
    info!(signal, "Received shutdown signal, draining connections...");
    shutdown.trigger();

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Listener did not shut down cleanly"),
            Err(e) => error!(error = %e, "Listener task panicked"),
        }
    }

    info!(
        handles_built = registry.factory().stats().get_handles_built(),
        requests_forwarded = registry.factory().stats().get_requests_forwarded(),
        "Shutdown complete"
    );
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        http_addr = %config.server.http_addr,
        https_addr = %config.server.https_addr,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        header_read_timeout_secs = config.server.header_read_timeout_secs,
        request_read_timeout_secs = config.server.request_read_timeout_secs,
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        "Timeout settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );

    let mut hosts: Vec<_> = config.backends.iter().collect();
    hosts.sort();
    for (host, backend) in hosts {
        info!(host = %host, backend = %backend, "Backend configured");
    }
}
