//! Host selection: mapping a declared host name (Host header or TLS SNI) to
//! one virtual host.
//!
//! Lookup is an exact case-insensitive match against each host's primary name
//! or aliases, falling back to the host registered under the wildcard name
//! `"*"`. A table without a default host refuses to build; the failure
//! surfaces at startup, never at request time.
use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use crate::core::vhost::{TlsIdentity, VirtualHost};

/// The name under which the default (fallback) host is registered.
pub const WILDCARD_NAME: &str = "*";

/// Errors raised while assembling a routing table
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RoutingTableError {
    /// The server must refuse to start without at least one default host
    #[error("No default host registered: add a virtual host named \"*\"")]
    NoDefaultHost,

    #[error("Duplicate host name registration: {0}")]
    DuplicateName(String),
}

/// Result type for routing table assembly
pub type RoutingTableResult<T> = Result<T, RoutingTableError>;

/// Read-only name → virtual host map with a wildcard default.
///
/// Built once per server instance via [`RoutingTableBuilder`]; pure lookups
/// at serving time. The same resolution step backs both Host-header routing
/// and the TLS server-name-indication callback, which runs before the
/// handshake completes.
#[derive(Debug)]
pub struct RoutingTable {
    default_host: Arc<VirtualHost>,
    by_name: HashMap<String, Arc<VirtualHost>>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Map a declared host name to a virtual host. `None` or an unregistered
    /// name selects the default host. Pure lookup, no side effects.
    pub fn select(&self, name: Option<&str>) -> Arc<VirtualHost> {
        match name {
            Some(raw) => {
                let normalized = Self::strip_port(raw).to_lowercase();
                self.by_name
                    .get(&normalized)
                    .cloned()
                    .unwrap_or_else(|| self.default_host.clone())
            }
            None => self.default_host.clone(),
        }
    }

    /// The TLS identity serving a negotiated server name, resolved through
    /// the same host lookup used for request routing.
    pub fn identity_for(&self, server_name: Option<&str>) -> Option<TlsIdentity> {
        self.select(server_name).tls_identity().cloned()
    }

    pub fn default_host(&self) -> &Arc<VirtualHost> {
        &self.default_host
    }

    /// All distinct hosts in the table, default included.
    pub fn hosts(&self) -> Vec<Arc<VirtualHost>> {
        let mut seen: Vec<Arc<VirtualHost>> = Vec::new();
        for host in std::iter::once(&self.default_host).chain(self.by_name.values()) {
            if !seen.iter().any(|h| Arc::ptr_eq(h, host)) {
                seen.push(host.clone());
            }
        }
        seen
    }

    /// Host header values may carry a port; names never do.
    fn strip_port(name: &str) -> &str {
        name.rsplit_once(':')
            .map(|(host, port)| {
                if port.chars().all(|c| c.is_ascii_digit()) {
                    host
                } else {
                    name
                }
            })
            .unwrap_or(name)
    }
}

/// Builder registering virtual hosts by primary name and alias.
#[derive(Default)]
pub struct RoutingTableBuilder {
    hosts: Vec<Arc<VirtualHost>>,
}

impl RoutingTableBuilder {
    /// Register a host. One registered under the wildcard name `"*"` becomes
    /// the default.
    pub fn host(mut self, host: VirtualHost) -> Self {
        self.hosts.push(Arc::new(host));
        self
    }

    pub fn shared_host(mut self, host: Arc<VirtualHost>) -> Self {
        self.hosts.push(host);
        self
    }

    /// Assemble the table. Fails when no default host was registered or a
    /// name is claimed twice.
    pub fn build(self) -> RoutingTableResult<RoutingTable> {
        let mut by_name: HashMap<String, Arc<VirtualHost>> = HashMap::new();
        let mut default_host: Option<Arc<VirtualHost>> = None;

        for host in self.hosts {
            for name in
                std::iter::once(host.primary_name().to_string()).chain(host.aliases().iter().cloned())
            {
                if name == WILDCARD_NAME {
                    if default_host.is_some() {
                        return Err(RoutingTableError::DuplicateName(name));
                    }
                    default_host = Some(host.clone());
                } else if by_name.insert(name.clone(), host.clone()).is_some() {
                    return Err(RoutingTableError::DuplicateName(name));
                }
            }
        }

        let default_host = default_host.ok_or(RoutingTableError::NoDefaultHost)?;

        tracing::debug!(
            hosts = by_name.len() + 1,
            "Routing table assembled with default host"
        );

        Ok(RoutingTable {
            default_host,
            by_name,
        })
    }
}
