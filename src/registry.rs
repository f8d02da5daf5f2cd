//! Routing table: virtual host -> backend, with lazily built forwarding handles
//!
//! The set of hosts is fixed when the registry is created. The only mutation
//! afterwards is attaching a forwarding handle to a destination the first
//! time it is used, which happens at most once per host.

use crate::error::RegistryError;
use crate::forward::{ForwardingHandle, ProxyFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

/// One routable backend
#[derive(Debug)]
pub struct Destination {
    host_key: String,
    backend_url: String,
    handle: OnceCell<Arc<ForwardingHandle>>,
}

impl Destination {
    fn new(host_key: String, backend_url: String) -> Self {
        Self {
            host_key,
            backend_url,
            handle: OnceCell::new(),
        }
    }

    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// The forwarding handle, if one has been built
    pub fn handle(&self) -> Option<Arc<ForwardingHandle>> {
        self.handle.get().cloned()
    }
}

/// Host -> destination map shared by all request handlers
pub struct Registry {
    destinations: HashMap<String, Destination>,
    factory: ProxyFactory,
}

impl Registry {
    /// Build a registry from a `host -> backend URL` mapping
    pub fn new<I, K, V>(routes: I, factory: ProxyFactory) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let destinations = routes
            .into_iter()
            .map(|(host, url)| {
                let host = host.into();
                (host.clone(), Destination::new(host, url.into()))
            })
            .collect();

        Self {
            destinations,
            factory,
        }
    }

    /// Build a registry using a default [`ProxyFactory`]
    pub fn from_routes<I, K, V>(routes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(routes, ProxyFactory::default())
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Configured host keys, sorted
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.destinations.keys().map(String::as_str).collect();
        hosts.sort_unstable();
        hosts
    }

    pub fn factory(&self) -> &ProxyFactory {
        &self.factory
    }

    /// Exact match on the host, port included. No wildcard or suffix matching.
    pub fn lookup(&self, host_key: &str) -> Result<&Destination, RegistryError> {
        self.destinations
            .get(host_key)
            .ok_or_else(|| RegistryError::UnknownHost(host_key.to_string()))
    }

    /// Return the cached handle for `host_key`, building it on first use.
    ///
    /// Concurrent first requests for the same host wait on the entry's cell,
    /// so exactly one handle is ever built per host. A failed build leaves
    /// the cell empty; the backend URL is immutable, so every later call
    /// fails the same way.
    pub async fn get_or_create_handle(
        &self,
        host_key: &str,
    ) -> Result<Arc<ForwardingHandle>, RegistryError> {
        let destination = self.lookup(host_key)?;

        if let Some(handle) = destination.handle.get() {
            return Ok(Arc::clone(handle));
        }

        let handle = destination
            .handle
            .get_or_try_init(|| async {
                debug!(
                    host = %destination.host_key,
                    backend = %destination.backend_url,
                    "Creating forwarding handle"
                );
                self.factory
                    .build(&destination.backend_url)
                    .map(Arc::new)
                    .map_err(|e| {
                        error!(host = %destination.host_key, error = %e, "Backend URL rejected");
                        e
                    })
            })
            .await?;

        Ok(Arc::clone(handle))
    }
}
