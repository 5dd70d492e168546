//! Configuration data structures for arbor.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! They are intentionally serde-friendly and include defaults so that
//! minimal configs remain concise. Dispatchers are code, not configuration:
//! resolver entries reference a dispatcher by name and the embedder supplies
//! the callbacks when assembling the routing table.
use std::{collections::HashMap, time::Duration};

use eyre::WrapErr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    core::{
        address::{NodeAddress, ProtocolVersion},
        endpoint::Endpoint,
        pool::PoolConfig,
        resolver::{Dispatcher, EndpointResolver},
        routing::RoutingTable,
        transport::ClientDefaults,
        vhost::{TlsIdentity, VirtualHost},
    },
};

fn default_protocol() -> ProtocolVersion {
    ProtocolVersion::Http1
}

fn default_connection_limit() -> usize {
    8
}

fn default_retry_budget() -> u32 {
    3
}

fn default_max_redirects() -> u32 {
    5
}

fn default_follow_redirects() -> bool {
    true
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Durations are written in humantime form ("30s", "2m 30s").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// TLS certificate material on disk for one virtual host.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsFilesConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// One endpoint matching rule.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Literal path prefix, e.g. "/static"
    pub prefix: String,
    /// Glob suffix pattern after the prefix, e.g. "/**"
    #[serde(default)]
    pub pattern: String,
    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    /// Allowed content types; empty means any
    #[serde(default)]
    pub content_types: Vec<String>,
}

impl EndpointConfig {
    pub fn build(&self) -> eyre::Result<Endpoint> {
        let mut builder = Endpoint::builder(&self.prefix).pattern(&self.pattern);
        for method in &self.methods {
            builder = builder.method(method);
        }
        for content_type in &self.content_types {
            builder = builder.content_type(content_type);
        }
        builder
            .build()
            .wrap_err_with(|| format!("Invalid endpoint for prefix '{}'", self.prefix))
    }
}

/// One resolver: ordered endpoints plus the dispatcher serving them, either
/// a named callback supplied by the embedder or the built-in static file
/// dispatcher.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResolverConfig {
    pub endpoints: Vec<EndpointConfig>,
    /// Name of an embedder-supplied dispatcher
    #[serde(default)]
    pub dispatcher: Option<String>,
    /// Root directory for the built-in static file dispatcher
    #[serde(default)]
    pub static_root: Option<String>,
}

/// One virtual host: identity, address and resolvers in registration order.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VirtualHostConfig {
    /// Primary name; "*" registers the default host
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolVersion,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub tls: Option<TlsFilesConfig>,
    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,
}

impl VirtualHostConfig {
    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(&self.host, self.port, self.protocol, self.secure)
    }
}

/// Server-side configuration: the listener plus its virtual hosts.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

impl ServerConfig {
    /// Assemble the routing table, pairing resolver configs with the named
    /// dispatchers supplied by the embedder.
    pub fn build_table(
        &self,
        dispatchers: &HashMap<String, Dispatcher>,
    ) -> eyre::Result<RoutingTable> {
        let mut table = RoutingTable::builder();

        for host_config in &self.virtual_hosts {
            let mut builder = VirtualHost::builder(&host_config.name).address(host_config.address());
            for alias in &host_config.aliases {
                builder = builder.alias(alias);
            }
            if let Some(tls) = &host_config.tls {
                let identity = TlsIdentity::from_pem_files(&tls.cert_path, &tls.key_path)
                    .wrap_err_with(|| {
                        format!("Failed to load TLS identity for host '{}'", host_config.name)
                    })?;
                builder = builder.tls_identity(identity);
            }

            for resolver_config in &host_config.resolvers {
                let endpoints = resolver_config
                    .endpoints
                    .iter()
                    .map(EndpointConfig::build)
                    .collect::<eyre::Result<Vec<_>>>()?;

                let dispatcher: Dispatcher = match (
                    &resolver_config.dispatcher,
                    &resolver_config.static_root,
                ) {
                    (Some(name), None) => dispatchers
                        .get(name)
                        .cloned()
                        .ok_or_else(|| eyre::eyre!("Unknown dispatcher '{name}'"))?,
                    (None, Some(root)) => {
                        let prefix = resolver_config
                            .endpoints
                            .first()
                            .map(|endpoint| endpoint.prefix.clone())
                            .unwrap_or_default();
                        crate::adapters::static_dir_dispatcher(root.clone(), &prefix)
                    }
                    _ => {
                        eyre::bail!(
                            "Resolver on host '{}' must name exactly one of 'dispatcher' or 'static_root'",
                            host_config.name
                        )
                    }
                };

                builder = builder.resolver(EndpointResolver::new(endpoints, dispatcher));
            }

            let host = builder
                .build()
                .wrap_err_with(|| format!("Invalid virtual host '{}'", host_config.name))?;
            table = table.host(host);
        }

        table.build().wrap_err("Failed to assemble routing table")
    }
}

/// One outbound destination for the client pool.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolVersion,
    #[serde(default)]
    pub secure: bool,
}

impl NodeConfig {
    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(&self.host, self.port, self.protocol, self.secure)
    }
}

/// Client-side configuration: pool sizing and exchange defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub connection_limit: usize,
    pub retry_budget: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub acquire_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub request_timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub protocol: ProtocolVersion,
    pub nodes: Vec<NodeConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_limit: default_connection_limit(),
            retry_budget: default_retry_budget(),
            acquire_timeout: default_acquire_timeout(),
            request_timeout: default_request_timeout(),
            follow_redirects: default_follow_redirects(),
            max_redirects: default_max_redirects(),
            protocol: default_protocol(),
            nodes: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            limit: self.connection_limit,
            retry_budget: self.retry_budget,
            acquire_timeout: self.acquire_timeout,
        }
    }

    pub fn client_defaults(&self) -> ClientDefaults {
        ClientDefaults {
            timeout: self.request_timeout,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            version: self.protocol,
        }
    }

    pub fn node_addresses(&self) -> Vec<NodeAddress> {
        self.nodes.iter().map(NodeConfig::address).collect()
    }
}
