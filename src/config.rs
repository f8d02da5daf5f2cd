use crate::tls::TlsVersion;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, TLS and timeout settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Virtual host -> backend base URL
    ///
    /// Keys are matched literally against the request host, so
    /// `"example.com"` and `"example.com:443"` are distinct entries.
    #[serde(default)]
    pub backends: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address used for listen addresses given as `:<port>` (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plain HTTP listen address (default: ":80", empty string disables)
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// HTTPS listen address (default: ":443"), only used when cert and key are set
    #[serde(default = "default_https_addr")]
    pub https_addr: String,

    /// Path to TLS certificate chain (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key (PEM format)
    pub tls_key: Option<String>,

    /// Lowest TLS protocol version accepted: "1.2" or "1.3"
    #[serde(default = "default_min_tls_version")]
    pub min_tls_version: String,

    /// Highest TLS protocol version accepted: "1.2" or "1.3"
    #[serde(default = "default_max_tls_version")]
    pub max_tls_version: String,

    /// Ordered cipher suite allowlist, most preferred first.
    /// Empty means the built-in list.
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Time allowed for a client to send request headers
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,

    /// Time allowed for a client to send the request body
    #[serde(default = "default_request_read_timeout")]
    pub request_read_timeout_secs: u64,

    /// Drain deadline after a termination signal
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Resolved plain HTTP address, `None` when disabled
    pub fn http_listen_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        if self.http_addr.trim().is_empty() {
            return Ok(None);
        }
        parse_listen_addr(&self.bind, &self.http_addr).map(Some)
    }

    /// Resolved HTTPS address, `None` when no certificate is configured
    pub fn https_listen_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        if !self.tls_enabled() || self.https_addr.trim().is_empty() {
            return Ok(None);
        }
        parse_listen_addr(&self.bind, &self.https_addr).map(Some)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    pub fn request_read_timeout(&self) -> Duration {
        Duration::from_secs(self.request_read_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Validate the server configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err("'tls_cert' and 'tls_key' must be set together".to_string());
        }

        self.http_listen_addr()
            .map_err(|e| format!("'http_addr': {}", e))?;
        self.https_listen_addr()
            .map_err(|e| format!("'https_addr': {}", e))?;

        let min = TlsVersion::parse(&self.min_tls_version)
            .ok_or_else(|| format!("Unknown 'min_tls_version' {:?}", self.min_tls_version))?;
        let max = TlsVersion::parse(&self.max_tls_version)
            .ok_or_else(|| format!("Unknown 'max_tls_version' {:?}", self.max_tls_version))?;
        if min > max {
            return Err(format!(
                "'min_tls_version' {} is above 'max_tls_version' {}",
                self.min_tls_version, self.max_tls_version
            ));
        }

        if self.header_read_timeout_secs == 0 || self.request_read_timeout_secs == 0 {
            return Err("read timeouts must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            tls_cert: None,
            tls_key: None,
            min_tls_version: default_min_tls_version(),
            max_tls_version: default_max_tls_version(),
            cipher_suites: Vec::new(),
            header_read_timeout_secs: default_header_read_timeout(),
            request_read_timeout_secs: default_request_read_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Parse a listen address of the form `:<port>` (joined with `bind`) or `ip:port`
pub fn parse_listen_addr(bind: &str, addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid port in {:?}: {}", addr, e))?;
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {:?}: {}", bind, e))?;
        return Ok(SocketAddr::new(ip, port));
    }

    addr.parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {:?}: {}", addr, e))
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_addr() -> String {
    ":80".to_string()
}

fn default_https_addr() -> String {
    ":443".to_string()
}

fn default_min_tls_version() -> String {
    "1.2".to_string()
}

fn default_max_tls_version() -> String {
    "1.3".to_string()
}

fn default_header_read_timeout() -> u64 {
    10
}

fn default_request_read_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    10 // drain window after SIGINT/SIGTERM
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    ///
    /// Backend URLs are not checked here. A bad URL only fails requests
    /// for its own host.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.validate() {
            errors.push(e);
        }

        for host in self.backends.keys() {
            if host.trim().is_empty() {
                errors.push("Backend host key must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
