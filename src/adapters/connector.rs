//! Connection establishment over tokio TCP, rustls TLS and hyper's
//! connection-level client codecs.
//!
//! Responsibilities:
//! * Dial a node and run the TLS handshake when the address is secure,
//!   offering the ALPN identifier matching the node's protocol version
//! * Run the hyper HTTP/1 or HTTP/2 handshake and drive the connection on a
//!   background task
//! * Expose established connections through the [`Channel`] port, with
//!   exclusive HTTP/1 channels and multiplexed HTTP/2 channels
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, Uri, header, uri::PathAndQuery};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls_native_certs::load_native_certs;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::{
    core::address::{NodeAddress, ProtocolVersion},
    ports::connection::{
        Channel, ChannelError, ChannelResult, Connector, ConnectorError, ConnectorResult,
    },
};

/// Connector adapter dialing nodes with tokio + rustls + hyper.
pub struct HyperConnector {
    tls_http1: Arc<rustls::ClientConfig>,
    tls_http2: Arc<rustls::ClientConfig>,
}

impl HyperConnector {
    /// Create a connector with the platform's native root certificates.
    pub fn new() -> eyre::Result<Self> {
        crate::adapters::ensure_crypto_provider();

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        Ok(Self::with_root_store(root_cert_store))
    }

    /// Create a connector trusting the given roots. Used by tests with
    /// generated authorities.
    pub fn with_root_store(roots: rustls::RootCertStore) -> Self {
        crate::adapters::ensure_crypto_provider();
        let base = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let mut tls_http1 = base.clone();
        tls_http1.alpn_protocols = vec![ProtocolVersion::Http1.alpn_id().to_vec()];
        let mut tls_http2 = base;
        tls_http2.alpn_protocols = vec![ProtocolVersion::Http2.alpn_id().to_vec()];

        Self {
            tls_http1: Arc::new(tls_http1),
            tls_http2: Arc::new(tls_http2),
        }
    }

    async fn establish<T>(&self, node: &NodeAddress, io: T) -> ConnectorResult<Arc<dyn Channel>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        match node.version() {
            ProtocolVersion::Http1 => {
                let (sender, connection) = http1::handshake(TokioIo::new(io))
                    .await
                    .map_err(|e| ConnectorError::Protocol {
                        node: node.to_string(),
                        reason: e.to_string(),
                    })?;
                let flag = closed.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::debug!(error = %e, "HTTP/1 connection task ended");
                    }
                    flag.store(true, Ordering::Release);
                });
                Ok(Arc::new(Http1Channel {
                    sender: tokio::sync::Mutex::new(sender),
                    closed,
                }))
            }
            ProtocolVersion::Http2 => {
                let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(io))
                    .await
                    .map_err(|e| ConnectorError::Protocol {
                        node: node.to_string(),
                        reason: e.to_string(),
                    })?;
                let flag = closed.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::debug!(error = %e, "HTTP/2 connection task ended");
                    }
                    flag.store(true, Ordering::Release);
                });
                Ok(Arc::new(Http2Channel {
                    sender,
                    closed,
                    streams: AtomicU64::new(0),
                }))
            }
        }
    }
}

#[async_trait]
impl Connector for HyperConnector {
    async fn connect(&self, node: &NodeAddress) -> ConnectorResult<Arc<dyn Channel>> {
        let stream = TcpStream::connect(node.authority())
            .await
            .map_err(|e| ConnectorError::Unreachable {
                node: node.to_string(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        if node.is_secure() {
            let config = match node.version() {
                ProtocolVersion::Http1 => self.tls_http1.clone(),
                ProtocolVersion::Http2 => self.tls_http2.clone(),
            };
            let server_name = ServerName::try_from(node.host().to_string()).map_err(|e| {
                ConnectorError::Handshake {
                    node: node.to_string(),
                    reason: e.to_string(),
                }
            })?;
            let tls_stream = TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(|e| ConnectorError::Handshake {
                    node: node.to_string(),
                    reason: e.to_string(),
                })?;
            self.establish(node, tls_stream).await
        } else {
            self.establish(node, stream).await
        }
    }
}

/// Exclusive HTTP/1 channel: one exchange at a time, serialized internally.
struct Http1Channel {
    sender: tokio::sync::Mutex<http1::SendRequest<Full<Bytes>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Channel for Http1Channel {
    async fn exchange(&self, req: Request<Bytes>) -> ChannelResult<Response<Bytes>> {
        let req = to_origin_form(req)?;
        // The lock is held until the body is fully read; an HTTP/1
        // connection cannot start the next exchange before that.
        let mut sender = self.sender.lock().await;
        sender.ready().await.map_err(map_hyper_error)?;
        let response = sender.send_request(req).await.map_err(map_hyper_error)?;
        collect_response(response).await
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

/// Multiplexed HTTP/2 channel: concurrent exchanges as independent streams
/// over one shared connection.
struct Http2Channel {
    sender: http2::SendRequest<Full<Bytes>>,
    closed: Arc<AtomicBool>,
    streams: AtomicU64,
}

#[async_trait]
impl Channel for Http2Channel {
    async fn exchange(&self, req: Request<Bytes>) -> ChannelResult<Response<Bytes>> {
        // HTTP/2 carries the authority in the request pseudo-headers; the
        // absolute URI stays, a Host header would be redundant.
        let (mut parts, body) = req.into_parts();
        parts.headers.remove(header::HOST);
        let req = Request::from_parts(parts, Full::new(body));

        let mut sender = self.sender.clone();
        let response = sender.send_request(req).await.map_err(map_hyper_error)?;
        collect_response(response).await
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn is_multiplexed(&self) -> bool {
        true
    }

    fn next_stream_id(&self) -> Option<u64> {
        // Client-initiated HTTP/2 streams carry odd identifiers.
        Some(client_stream_id(self.streams.fetch_add(1, Ordering::Relaxed)))
    }
}

/// The identifier of the n-th client-initiated stream (0-based).
fn client_stream_id(n: u64) -> u64 {
    2 * n + 1
}

/// Rewrite an absolute-URI request to the origin form HTTP/1 expects,
/// deriving the Host header from the authority.
fn to_origin_form(req: Request<Bytes>) -> ChannelResult<Request<Full<Bytes>>> {
    let (mut parts, body) = req.into_parts();

    let authority = parts.uri.authority().cloned();
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path_and_query);

    if let Some(authority) = authority
        && !parts.headers.contains_key(header::HOST)
    {
        let value = header::HeaderValue::try_from(authority.as_str())
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        parts.headers.insert(header::HOST, value);
    }
    if !parts.headers.contains_key(header::USER_AGENT) {
        parts
            .headers
            .insert(header::USER_AGENT, header::HeaderValue::from_static("arbor/0.1"));
    }

    Ok(Request::from_parts(parts, Full::new(body)))
}

async fn collect_response(
    response: Response<hyper::body::Incoming>,
) -> ChannelResult<Response<Bytes>> {
    let (parts, incoming) = response.into_parts();
    let bytes = incoming
        .collect()
        .await
        .map_err(map_hyper_error)?
        .to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

fn map_hyper_error(e: hyper::Error) -> ChannelError {
    if e.is_canceled() || e.is_incomplete_message() {
        ChannelError::Inactive
    } else {
        ChannelError::Wire(e.to_string())
    }
}
