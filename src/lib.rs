//! Reprox - a host-based HTTP/HTTPS reverse proxy
//!
//! Requests are routed by their literal host (port included) to a fixed
//! set of backend base URLs:
//! - The registry maps hosts to backends and builds one forwarding handle
//!   per host, lazily, on the first request for it
//! - Handles share one pooled HTTP client and rewrite hop-by-hop and
//!   forwarding headers on the way through
//! - Plain and TLS listeners serve HTTP/1.1 and HTTP/2 with header and body
//!   read timeouts
//! - SIGINT/SIGTERM close the listeners and drain in-flight requests up to
//!   a deadline

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forward;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod tls;
