//! Server adapter: accept loop, TLS virtual hosting and the hyper service
//! bridge into the routing engine.
//!
//! TLS certificate selection delegates to the routing table's host lookup
//! during the server-name-indication callback, before the handshake
//! completes. After the handshake, the ALPN result selects the HTTP/1 or
//! HTTP/2 server pipeline; plain listeners use hyper's automatic version
//! detection.
use std::{
    collections::HashMap, convert::Infallible, future::Future, net::SocketAddr, sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use eyre::WrapErr;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::{
    core::{routing::RoutingTable, server::ServerEngine},
    utils::connection_tracker::{ConnectionRecord, ConnectionTracker},
};

/// Certificate resolver delegating to the routing table's host selection.
struct TableCertResolver {
    table: Arc<RoutingTable>,
    keys: HashMap<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for TableCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCertResolver")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl ResolvesServerCert for TableCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        // Same resolution step as request routing, ahead of the handshake.
        let host = self.table.select(client_hello.server_name());
        self.keys.get(host.primary_name()).cloned()
    }
}

fn build_cert_resolver(table: &Arc<RoutingTable>) -> eyre::Result<TableCertResolver> {
    let mut keys = HashMap::new();
    for host in table.hosts() {
        if let Some(identity) = host.tls_identity() {
            let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(identity.key())
                .map_err(|e| {
                eyre::eyre!(
                    "Unusable private key for host '{}': {e}",
                    host.primary_name()
                )
            })?;
            keys.insert(
                host.primary_name().to_string(),
                Arc::new(CertifiedKey::new(
                    identity.cert_chain().to_vec(),
                    signing_key,
                )),
            );
        }
    }
    if keys.is_empty() {
        eyre::bail!("TLS serving requires at least one virtual host with a TLS identity");
    }
    Ok(TableCertResolver {
        table: table.clone(),
        keys,
    })
}

/// A bound HTTP server serving one routing engine.
pub struct Server {
    engine: ServerEngine,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl Server {
    /// Bind a plain listener.
    pub async fn bind(engine: ServerEngine, addr: &str) -> eyre::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {addr}"))?;
        tracing::info!(addr = %listener.local_addr()?, "Listening (plain)");
        Ok(Self {
            engine,
            listener,
            tls_acceptor: None,
            tracker: ConnectionTracker::new(),
            drain_timeout: Duration::from_secs(10),
        })
    }

    /// Bind a TLS listener with per-name certificate selection from the
    /// engine's routing table.
    pub async fn bind_tls(engine: ServerEngine, addr: &str) -> eyre::Result<Self> {
        crate::adapters::ensure_crypto_provider();

        let resolver = build_cert_resolver(engine.table())?;
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {addr}"))?;
        tracing::info!(addr = %listener.local_addr()?, "Listening (TLS)");
        Ok(Self {
            engine,
            listener,
            tls_acceptor: Some(TlsAcceptor::from(Arc::new(config))),
            tracker: ConnectionTracker::new(),
            drain_timeout: Duration::from_secs(10),
        })
    }

    pub fn local_addr(&self) -> eyre::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Serve until the process ends.
    pub async fn serve(self) -> eyre::Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Serve until the shutdown future resolves, then drain in-flight
    /// exchanges bounded by the drain timeout.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) -> eyre::Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let record = self.tracker.register(remote_addr);
                    let engine = self.engine.clone();
                    let tracker = self.tracker.clone();
                    let acceptor = self.tls_acceptor.clone();
                    tokio::spawn(async move {
                        handle_connection(engine, stream, record.clone(), acceptor).await;
                        tracker.unregister(record.id);
                    });
                }
            }
        }

        tracing::info!("Shutdown requested, draining connections");
        self.tracker.signal_shutdown();
        self.tracker.wait_for_drain(self.drain_timeout).await;
        Ok(())
    }
}

async fn handle_connection(
    engine: ServerEngine,
    stream: TcpStream,
    record: Arc<ConnectionRecord>,
    acceptor: Option<TlsAcceptor>,
) {
    match acceptor {
        None => {
            let service = engine_service(engine, record, None);
            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(error = %e, "Connection ended with error");
            }
        }
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    tracing::debug!(error = %e, "TLS handshake failed");
                    return;
                }
            };

            let (_, connection) = tls_stream.get_ref();
            let sni_name = connection.server_name().map(str::to_string);
            let negotiated_h2 = connection.alpn_protocol() == Some(b"h2".as_slice());
            let service = engine_service(engine, record, sni_name);

            // The ALPN result picks the server pipeline.
            let result = if negotiated_h2 {
                hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
            } else {
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "TLS connection ended with error");
            }
        }
    }
}

/// Bridge one connection's requests into the engine: buffer the decoded
/// body, dispatch, and hand the terminal response back to hyper.
#[derive(Clone)]
struct EngineService {
    engine: ServerEngine,
    record: Arc<ConnectionRecord>,
    sni_name: Option<String>,
}

fn engine_service(
    engine: ServerEngine,
    record: Arc<ConnectionRecord>,
    sni_name: Option<String>,
) -> EngineService {
    EngineService {
        engine,
        record,
        sni_name,
    }
}

impl hyper::service::Service<Request<Incoming>> for EngineService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        std::pin::Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let engine = self.engine.clone();
        let sni_name = self.sni_name.clone();
        let exchange = self.record.begin_exchange();
        Box::pin(async move {
            let _exchange = exchange;
            let (parts, body) = req.into_parts();
            let response = match body.collect().await {
                Ok(collected) => {
                    let req = Request::from_parts(parts, collected.to_bytes());
                    engine.handle(req, sni_name.as_deref()).await
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read request body");
                    Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(Bytes::from_static(b"unreadable request body"))
                        .unwrap_or_else(|_| Response::new(Bytes::new()))
                }
            };
            let (parts, bytes) = response.into_parts();
            Ok::<_, Infallible>(Response::from_parts(parts, Full::new(bytes)))
        })
    }
}
