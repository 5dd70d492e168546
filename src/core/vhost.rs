//! Virtual hosts: named routing units binding a host identity to an ordered
//! list of endpoint resolvers and an optional TLS identity.
use std::{collections::HashSet, fs::File, io::BufReader, path::Path, sync::Arc};

use bytes::Bytes;
use http::{Method, Response, StatusCode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::core::{
    address::NodeAddress,
    endpoint::PathParams,
    resolver::EndpointResolver,
};

/// Errors raised while building or loading a virtual host
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum VirtualHostError {
    #[error("Virtual host name cannot be empty")]
    EmptyName,

    #[error("Virtual host '{0}' has no network address")]
    MissingAddress(String),

    /// A host with a secure address cannot serve traffic without an identity
    #[error("Virtual host '{0}' has a secure address but no TLS identity")]
    MissingTlsIdentity(String),

    #[error("Failed to read TLS material from {path}: {reason}")]
    TlsRead { path: String, reason: String },

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("No certificates found in {0}")]
    NoCertificates(String),
}

/// Result type for virtual host operations
pub type VirtualHostResult<T> = Result<T, VirtualHostError>;

/// A certificate chain plus private key serving one host name.
pub struct TlsIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }

    /// Load an identity from PEM files on disk.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> VirtualHostResult<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let mut cert_reader = BufReader::new(File::open(cert_path).map_err(|e| {
            VirtualHostError::TlsRead {
                path: cert_path.display().to_string(),
                reason: e.to_string(),
            }
        })?);
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| VirtualHostError::TlsRead {
                path: cert_path.display().to_string(),
                reason: e.to_string(),
            })?;
        if cert_chain.is_empty() {
            return Err(VirtualHostError::NoCertificates(
                cert_path.display().to_string(),
            ));
        }

        let mut key_reader = BufReader::new(File::open(key_path).map_err(|e| {
            VirtualHostError::TlsRead {
                path: key_path.display().to_string(),
                reason: e.to_string(),
            }
        })?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| VirtualHostError::TlsRead {
                path: key_path.display().to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| VirtualHostError::NoPrivateKey(key_path.display().to_string()))?;

        Ok(Self::new(cert_chain, key))
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain", &self.cert_chain.len())
            .finish()
    }
}

/// A match within a virtual host: which resolver and endpoint apply, plus the
/// extracted path parameters.
#[derive(Debug)]
pub struct HostMatch {
    pub resolver_index: usize,
    pub endpoint_index: usize,
    pub params: PathParams,
}

/// A named routing unit.
///
/// Binds a primary name plus aliases and a network address to an ordered list
/// of endpoint resolvers. Resolvers are tried in registration order; within a
/// resolver, endpoints in declaration order; the first match wins. Built via
/// [`VirtualHostBuilder`], immutable after build.
pub struct VirtualHost {
    primary_name: String,
    aliases: HashSet<String>,
    address: NodeAddress,
    resolvers: Vec<Arc<EndpointResolver>>,
    tls_identity: Option<TlsIdentity>,
}

impl VirtualHost {
    pub fn builder(name: &str) -> VirtualHostBuilder {
        VirtualHostBuilder::new(name)
    }

    /// Copy-builder: inherits resolvers, address and TLS identity, but the
    /// new host carries its own name and aliases.
    pub fn copy_builder(&self, name: &str) -> VirtualHostBuilder {
        VirtualHostBuilder {
            name: name.to_string(),
            aliases: HashSet::new(),
            address: Some(self.address.clone()),
            resolvers: self.resolvers.clone(),
            tls_identity: self.tls_identity.clone(),
        }
    }

    pub fn primary_name(&self) -> &str {
        &self.primary_name
    }

    pub fn aliases(&self) -> &HashSet<String> {
        &self.aliases
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn tls_identity(&self) -> Option<&TlsIdentity> {
        self.tls_identity.as_ref()
    }

    pub fn resolvers(&self) -> &[Arc<EndpointResolver>] {
        &self.resolvers
    }

    /// Whether this host answers to the given name (primary or alias,
    /// case-insensitive).
    pub fn answers_to(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.primary_name == name || self.aliases.contains(&name)
    }

    /// Resolve a request to the first matching resolver/endpoint pair.
    pub fn resolve(
        &self,
        path: &str,
        method: &Method,
        content_type: Option<&str>,
    ) -> Option<HostMatch> {
        self.resolvers
            .iter()
            .enumerate()
            .find_map(|(resolver_index, resolver)| {
                resolver
                    .resolve(path, method, content_type)
                    .map(|matched| HostMatch {
                        resolver_index,
                        endpoint_index: matched.endpoint_index,
                        params: matched.params,
                    })
            })
    }

    pub fn resolver(&self, index: usize) -> Option<&Arc<EndpointResolver>> {
        self.resolvers.get(index)
    }

    /// The terminal outcome for a request no endpoint matched. The policy
    /// belongs to the host, not the resolver.
    pub fn unmatched_response(&self) -> Response<Bytes> {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Bytes::from_static(b"Not Found"))
            .unwrap_or_else(|_| Response::new(Bytes::new()))
    }
}

impl std::fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHost")
            .field("primary_name", &self.primary_name)
            .field("aliases", &self.aliases)
            .field("address", &self.address)
            .field("resolvers", &self.resolvers.len())
            .field("tls_identity", &self.tls_identity.is_some())
            .finish()
    }
}

/// Staged builder for [`VirtualHost`]. Cross-field validation happens at
/// [`build`](Self::build): a secure address requires a TLS identity.
pub struct VirtualHostBuilder {
    name: String,
    aliases: HashSet<String>,
    address: Option<NodeAddress>,
    resolvers: Vec<Arc<EndpointResolver>>,
    tls_identity: Option<TlsIdentity>,
}

impl VirtualHostBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            aliases: HashSet::new(),
            address: None,
            resolvers: Vec::new(),
            tls_identity: None,
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.insert(alias.to_lowercase());
        self
    }

    pub fn address(mut self, address: NodeAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Append a resolver; registration order is the resolution order.
    pub fn resolver(mut self, resolver: EndpointResolver) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    pub fn shared_resolver(mut self, resolver: Arc<EndpointResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn tls_identity(mut self, identity: TlsIdentity) -> Self {
        self.tls_identity = Some(identity);
        self
    }

    pub fn build(self) -> VirtualHostResult<VirtualHost> {
        if self.name.is_empty() {
            return Err(VirtualHostError::EmptyName);
        }

        let address = self
            .address
            .ok_or_else(|| VirtualHostError::MissingAddress(self.name.clone()))?;

        if address.is_secure() && self.tls_identity.is_none() {
            return Err(VirtualHostError::MissingTlsIdentity(self.name));
        }

        Ok(VirtualHost {
            primary_name: self.name.to_lowercase(),
            aliases: self.aliases,
            address,
            resolvers: self.resolvers,
            tls_identity: self.tls_identity,
        })
    }
}
