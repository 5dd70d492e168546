use std::fmt;

use thiserror::Error;
use url::Url;

/// Errors related to destination address handling
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AddressError {
    /// Error when URL cannot be parsed
    #[error("Invalid destination URL: {0}")]
    InvalidUrl(String),

    /// Error when the URL scheme is not http or https
    #[error("Unsupported URL scheme '{0}', expected http or https")]
    UnsupportedScheme(String),

    /// Error when the URL has no host component
    #[error("Destination URL has no host: {0}")]
    MissingHost(String),
}

/// Result type for address operations
pub type AddressResult<T> = Result<T, AddressError>;

/// HTTP protocol major version carried by a destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// HTTP/1.x, one exchange at a time per connection
    Http1,
    /// HTTP/2, stream-multiplexed over a shared connection
    Http2,
}

impl ProtocolVersion {
    /// The ALPN protocol identifier negotiated for this version.
    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            ProtocolVersion::Http1 => b"http/1.1",
            ProtocolVersion::Http2 => b"h2",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Http1 => write!(f, "HTTP/1"),
            ProtocolVersion::Http2 => write!(f, "HTTP/2"),
        }
    }
}

/// A network destination: host, port, protocol major version and secure flag.
///
/// Two addresses are interchangeable (poolable together) iff all four fields
/// are equal; equality and hashing drive pool and routing lookups. Created at
/// configuration time or derived from a request URL, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    host: String,
    port: u16,
    version: ProtocolVersion,
    secure: bool,
}

impl NodeAddress {
    /// Create an address from its parts. The host is lowercased so lookups
    /// are case-insensitive.
    pub fn new(host: &str, port: u16, version: ProtocolVersion, secure: bool) -> Self {
        Self {
            host: host.to_lowercase(),
            port,
            version,
            secure,
        }
    }

    /// Derive an address from a request URL.
    ///
    /// The scheme decides the secure flag and the default port (80/443);
    /// the protocol version is supplied by the caller since a URL does not
    /// carry it.
    pub fn from_url(url: &Url, version: ProtocolVersion) -> AddressResult<Self> {
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(AddressError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| AddressError::MissingHost(url.to_string()))?;

        let port = url
            .port()
            .unwrap_or(if secure { 443 } else { 80 });

        Ok(Self::new(host, port, version, secure))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The `host:port` authority form used when dialing.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(
            f,
            "{}://{}:{} ({})",
            scheme, self.host, self.port, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_defaults_ports_by_scheme() {
        let plain = Url::parse("http://example.com/path").unwrap();
        let addr = NodeAddress::from_url(&plain, ProtocolVersion::Http1).unwrap();
        assert_eq!(addr.host(), "example.com");
        assert_eq!(addr.port(), 80);
        assert!(!addr.is_secure());

        let secure = Url::parse("https://example.com/").unwrap();
        let addr = NodeAddress::from_url(&secure, ProtocolVersion::Http2).unwrap();
        assert_eq!(addr.port(), 443);
        assert!(addr.is_secure());
    }

    #[test]
    fn test_from_url_explicit_port() {
        let url = Url::parse("http://localhost:3000/api").unwrap();
        let addr = NodeAddress::from_url(&url, ProtocolVersion::Http1).unwrap();
        assert_eq!(addr.port(), 3000);
        assert_eq!(addr.authority(), "localhost:3000");
    }

    #[test]
    fn test_from_url_rejects_other_schemes() {
        let url = Url::parse("ftp://example.com").unwrap();
        assert!(NodeAddress::from_url(&url, ProtocolVersion::Http1).is_err());
    }

    #[test]
    fn test_equality_requires_all_four_fields() {
        let a = NodeAddress::new("example.com", 80, ProtocolVersion::Http1, false);
        let b = NodeAddress::new("Example.COM", 80, ProtocolVersion::Http1, false);
        assert_eq!(a, b); // host comparison is case-insensitive

        let c = NodeAddress::new("example.com", 80, ProtocolVersion::Http2, false);
        assert_ne!(a, c);

        let d = NodeAddress::new("example.com", 80, ProtocolVersion::Http1, true);
        assert_ne!(a, d);

        let e = NodeAddress::new("example.com", 8080, ProtocolVersion::Http1, false);
        assert_ne!(a, e);
    }
}
