//! Client-side transport: the unit of execution for one logical
//! request/response exchange, including redirect and retry orchestration.
//!
//! State machine: CREATED → DISPATCHED → (SUCCEEDED | FAILED), with a
//! REDIRECTING sub-transition that derives a new request context and loops
//! back to DISPATCHED, subject to the shared redirect budget. Completion is
//! signaled exactly once through the context, whichever terminal state wins.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, header};
use thiserror::Error;
use url::Url;

use crate::{
    core::{
        address::{NodeAddress, ProtocolVersion},
        context::{Cookie, RequestContext},
        pool::{BoundedConnectionPool, PoolConfig, PoolError},
    },
    ports::connection::{ChannelError, Connector},
};

/// Errors surfaced by client exchanges
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The shared redirect budget was exceeded
    #[error("too many redirections")]
    TooManyRedirects,

    /// The exchange deadline passed before dispatch
    #[error("request timed out before dispatch")]
    TimedOut,

    /// The byte-level transport failed during the exchange
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A redirect response carried an unusable Location
    #[error("Invalid redirect location: {0}")]
    InvalidRedirect(String),

    /// The request could not be constructed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type for client exchanges
pub type TransportResult<T> = Result<T, TransportError>;

/// Listener invoked with every terminal (non-redirected) response.
pub type ResponseListener = Arc<dyn Fn(&Response<Bytes>) + Send + Sync>;
/// Listener invoked at the moment an exchange fails.
pub type ExceptionListener = Arc<dyn Fn(&TransportError) + Send + Sync>;
/// Listener invoked for each cookie accumulated from a response.
pub type CookieListener = Arc<dyn Fn(&Cookie) + Send + Sync>;

/// Redirect status class honored by the transport.
/// 304 (Not Modified) is deliberately not part of it.
const REDIRECT_CODES: [u16; 7] = [300, 301, 302, 303, 305, 307, 308];

fn is_redirect(status: StatusCode) -> bool {
    REDIRECT_CODES.contains(&status.as_u16())
}

/// Immutable per-client exchange defaults, constructed once at build time
/// and threaded through by value.
#[derive(Debug, Clone)]
pub struct ClientDefaults {
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    /// Protocol version dialed for outbound connections
    pub version: ProtocolVersion,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            follow_redirects: true,
            max_redirects: 5,
            version: ProtocolVersion::Http1,
        }
    }
}

/// HTTP client over a bounded connection pool.
///
/// Cheap to clone; all clones share the pool and its permits.
#[derive(Clone)]
pub struct Client {
    pool: BoundedConnectionPool,
    defaults: ClientDefaults,
}

impl Client {
    pub fn builder(connector: Arc<dyn Connector>) -> ClientBuilder {
        ClientBuilder::new(connector)
    }

    pub fn pool(&self) -> &BoundedConnectionPool {
        &self.pool
    }

    /// Start building a request. The URL is validated at `send`/`dispatch`.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Shut down the underlying pool; in-flight exchanges finish, new
    /// dispatches fail fast.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Staged builder for [`Client`].
pub struct ClientBuilder {
    connector: Arc<dyn Connector>,
    nodes: Vec<NodeAddress>,
    pool_config: PoolConfig,
    defaults: ClientDefaults,
}

impl ClientBuilder {
    fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            nodes: Vec::new(),
            pool_config: PoolConfig::default(),
            defaults: ClientDefaults::default(),
        }
    }

    /// Register a node for round-robin spreading via the pool.
    pub fn node(mut self, node: NodeAddress) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn defaults(mut self, defaults: ClientDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn connection_limit(mut self, limit: usize) -> Self {
        self.pool_config.limit = limit;
        self
    }

    pub fn build(self) -> Client {
        Client {
            pool: BoundedConnectionPool::new(self.connector, self.nodes, self.pool_config),
            defaults: self.defaults,
        }
    }
}

/// Per-exchange builder carrying request data and listeners.
pub struct RequestBuilder {
    client: Client,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
    follow_redirects: Option<bool>,
    max_redirects: Option<u32>,
    response_listener: Option<ResponseListener>,
    exception_listener: Option<ExceptionListener>,
    cookie_listener: Option<CookieListener>,
}

impl RequestBuilder {
    fn new(client: Client, method: Method, url: &str) -> Self {
        Self {
            client,
            method,
            url: url.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            follow_redirects: None,
            max_redirects: None,
            response_listener: None,
            exception_listener: None,
            cookie_listener: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(name),
            header::HeaderValue::try_from(value),
        ) {
            self.headers.append(name, value);
        } else {
            tracing::warn!(name, "Dropping invalid request header");
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = Some(follow);
        self
    }

    pub fn max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = Some(max);
        self
    }

    pub fn on_response(mut self, listener: impl Fn(&Response<Bytes>) + Send + Sync + 'static) -> Self {
        self.response_listener = Some(Arc::new(listener));
        self
    }

    pub fn on_exception(mut self, listener: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.exception_listener = Some(Arc::new(listener));
        self
    }

    pub fn on_cookie(mut self, listener: impl Fn(&Cookie) + Send + Sync + 'static) -> Self {
        self.cookie_listener = Some(Arc::new(listener));
        self
    }

    fn into_transport(self) -> TransportResult<(Transport, RequestContext)> {
        let url = Url::parse(&self.url)
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", self.url)))?;

        let defaults = &self.client.defaults;
        let context = RequestContext::new(
            url,
            self.method,
            self.headers,
            self.body,
            self.timeout.unwrap_or(defaults.timeout),
            self.follow_redirects.unwrap_or(defaults.follow_redirects),
            self.max_redirects.unwrap_or(defaults.max_redirects),
        );

        let transport = Transport {
            pool: self.client.pool.clone(),
            version: defaults.version,
            response_listener: self.response_listener,
            exception_listener: self.exception_listener,
            cookie_listener: self.cookie_listener,
        };
        Ok((transport, context))
    }

    /// Execute the exchange on the current task and return the terminal
    /// response.
    pub async fn send(self) -> TransportResult<Response<Bytes>> {
        let (transport, context) = self.into_transport()?;
        transport.drive(context).await
    }

    /// Execute the exchange on a background task; the returned context is
    /// the caller's completion handle (`wait`, `wait_timeout`, `completed`).
    pub fn dispatch(self) -> TransportResult<RequestContext> {
        let (transport, context) = self.into_transport()?;
        let handle = context.clone();
        tokio::spawn(async move {
            let _ = transport.drive(context).await;
        });
        Ok(handle)
    }
}

/// The execution engine for one logical exchange.
struct Transport {
    pool: BoundedConnectionPool,
    version: ProtocolVersion,
    response_listener: Option<ResponseListener>,
    exception_listener: Option<ExceptionListener>,
    cookie_listener: Option<CookieListener>,
}

impl Transport {
    async fn drive(self, root: RequestContext) -> TransportResult<Response<Bytes>> {
        let span = tracing::info_span!(
            "client_exchange",
            exchange.id = %root.exchange_id(),
            http.method = %root.method(),
            url = %root.url(),
            http.status_code = tracing::field::Empty,
        );
        tracing::Instrument::instrument(self.drive_inner(root), span).await
    }

    async fn drive_inner(self, root: RequestContext) -> TransportResult<Response<Bytes>> {
        let mut context = root;

        loop {
            // Expiry is checked before a permit is consumed.
            if context.is_expired() {
                return Err(self.fail(&context, TransportError::TimedOut));
            }

            let node = match NodeAddress::from_url(context.url(), self.version) {
                Ok(node) => node,
                Err(e) => {
                    return Err(self.fail(&context, TransportError::InvalidRequest(e.to_string())));
                }
            };

            // Configured nodes are interchangeable replicas: the initial
            // dispatch spreads over them round-robin. A redirect names its
            // own target, so derived attempts pin the node from the URL.
            let acquired = if self.pool.has_nodes() && context.redirect_count() == 0 {
                self.pool.acquire().await
            } else {
                self.pool.acquire_to(&node).await
            };
            let connection = match acquired {
                Ok(connection) => connection,
                Err(e) => return Err(self.fail(&context, e.into())),
            };

            if connection.channel().is_multiplexed()
                && let Some(stream_id) = connection.channel().next_stream_id()
            {
                context.set_stream_id(stream_id);
            }

            let request = match self.wire_request(&context) {
                Ok(request) => request,
                Err(e) => return Err(self.fail(&context, e)),
            };

            let response = match connection.channel().exchange(request).await {
                Ok(response) => response,
                Err(e) => {
                    // An errored connection never rejoins the reusable set.
                    connection.mark_failed();
                    drop(connection);
                    return Err(self.fail(&context, e.into()));
                }
            };

            for cookie in context.accumulate_cookies(response.headers()) {
                if let Some(listener) = &self.cookie_listener {
                    listener(&cookie);
                }
            }

            if is_redirect(response.status()) && context.follow_redirects() {
                match self.derive_for_redirect(&context, &response) {
                    Ok(Some(derived)) => {
                        tracing::debug!(
                            status = response.status().as_u16(),
                            target = %derived.url(),
                            hop = context.redirect_count(),
                            "Following redirect"
                        );
                        drop(connection);
                        context = derived;
                        continue;
                    }
                    // Redirect class without a Location: terminal response.
                    Ok(None) => {}
                    Err(e) => {
                        drop(connection);
                        return Err(self.fail(&context, e));
                    }
                }
            }

            tracing::Span::current().record("http.status_code", response.status().as_u16());
            if let Some(listener) = &self.response_listener {
                listener(&response);
            }
            context.succeed();
            drop(connection);
            return Ok(response);
        }
    }

    /// Compute the derived context for a redirect response. `Ok(None)` means
    /// the response is terminal despite its status class.
    fn derive_for_redirect(
        &self,
        context: &RequestContext,
        response: &Response<Bytes>,
    ) -> TransportResult<Option<RequestContext>> {
        let Some(location) = response.headers().get(header::LOCATION) else {
            return Ok(None);
        };
        let location = location
            .to_str()
            .map_err(|_| TransportError::InvalidRedirect("non-ASCII Location".to_string()))?;

        if !context.try_take_redirect() {
            return Err(TransportError::TooManyRedirects);
        }

        // Absolute Locations are taken as-is; relative ones resolve against
        // the current request URL (RFC 3986), dropping query/fragment unless
        // the Location carries them.
        let target = context
            .url()
            .join(location)
            .map_err(|e| TransportError::InvalidRedirect(format!("{location}: {e}")))?;

        // 303 rewrites to GET and drops the body; the rest preserve both.
        let (method, body) = if response.status() == StatusCode::SEE_OTHER {
            (Method::GET, Bytes::new())
        } else {
            (context.method().clone(), context.body().clone())
        };

        let mut headers = context.headers().clone();
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if body.is_empty() {
            headers.remove(header::CONTENT_TYPE);
        }

        Ok(Some(context.derive(target, method, headers, body)))
    }

    /// Build the wire request for the current attempt. The URI is absolute;
    /// channels rewrite it to the form their protocol version expects.
    fn wire_request(&self, context: &RequestContext) -> TransportResult<Request<Bytes>> {
        let mut builder = Request::builder()
            .method(context.method().clone())
            .uri(context.url().as_str());

        if let Some(headers) = builder.headers_mut() {
            headers.extend(context.headers().clone());
            if let Some(cookie_value) = context.cookie_header() {
                let value = header::HeaderValue::try_from(cookie_value)
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                headers.insert(header::COOKIE, value);
            }
        }

        builder
            .body(context.body().clone())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }

    /// Settle the context failed, notify the exception listener, pass the
    /// error back to the caller.
    fn fail(&self, context: &RequestContext, error: TransportError) -> TransportError {
        context.fail(error.to_string());
        if let Some(listener) = &self.exception_listener {
            listener(&error);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::ports::connection::{
        Channel, ChannelResult, ConnectorResult,
    };

    /// Connector handing out one channel that replays scripted responses
    /// and records every request it sees.
    struct ScriptedConnector {
        channel: Arc<ScriptedChannel>,
    }

    struct ScriptedChannel {
        responses: Mutex<Vec<Response<Bytes>>>,
        requests: Mutex<Vec<Request<Bytes>>>,
    }

    impl ScriptedChannel {
        fn new(responses: Vec<Response<Bytes>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn recorded(&self) -> Vec<(Method, String, HeaderMap, Bytes)> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|req| {
                    (
                        req.method().clone(),
                        req.uri().to_string(),
                        req.headers().clone(),
                        req.body().clone(),
                    )
                })
                .collect()
        }
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        async fn exchange(&self, req: Request<Bytes>) -> ChannelResult<Response<Bytes>> {
            self.requests.lock().unwrap().push(req);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ChannelError::Inactive);
            }
            Ok(responses.remove(0))
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _node: &NodeAddress) -> ConnectorResult<Arc<dyn Channel>> {
            Ok(self.channel.clone())
        }
    }

    fn client_over(channel: Arc<ScriptedChannel>) -> Client {
        Client::builder(Arc::new(ScriptedConnector { channel })).build()
    }

    fn redirect(status: u16, location: &str) -> Response<Bytes> {
        Response::builder()
            .status(status)
            .header(header::LOCATION, location)
            .body(Bytes::new())
            .unwrap()
    }

    fn ok(body: &str) -> Response<Bytes> {
        Response::builder()
            .status(200)
            .body(Bytes::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_relative_location_resolves_against_base() {
        let channel = ScriptedChannel::new(vec![redirect(302, "/next"), ok("done")]);
        let client = client_over(channel.clone());

        let response = client
            .get("http://example.com/start?q=1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let recorded = channel.recorded();
        assert_eq!(recorded.len(), 2);
        // Path replaced, query dropped since Location carried none.
        assert_eq!(recorded[1].1, "http://example.com/next");
    }

    #[tokio::test]
    async fn test_absolute_location_taken_as_is() {
        let channel = ScriptedChannel::new(vec![
            redirect(301, "http://other.example.com/elsewhere"),
            ok("done"),
        ]);
        let client = client_over(channel.clone());

        client.get("http://example.com/").send().await.unwrap();
        assert_eq!(channel.recorded()[1].1, "http://other.example.com/elsewhere");
    }

    #[tokio::test]
    async fn test_303_forces_get_and_drops_body() {
        let channel = ScriptedChannel::new(vec![redirect(303, "/result"), ok("done")]);
        let client = client_over(channel.clone());

        client
            .post("http://example.com/form")
            .header("content-type", "application/json")
            .body(&b"{\"a\":1}"[..])
            .send()
            .await
            .unwrap();

        let recorded = channel.recorded();
        assert_eq!(recorded[0].0, Method::POST);
        assert_eq!(recorded[1].0, Method::GET);
        assert!(recorded[1].3.is_empty());
        assert!(!recorded[1].2.contains_key(header::CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_307_preserves_method_and_body() {
        let channel = ScriptedChannel::new(vec![redirect(307, "/retry"), ok("done")]);
        let client = client_over(channel.clone());

        client
            .post("http://example.com/submit")
            .body(&b"payload"[..])
            .send()
            .await
            .unwrap();

        let recorded = channel.recorded();
        assert_eq!(recorded[1].0, Method::POST);
        assert_eq!(recorded[1].3.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_redirect_budget_is_exact() {
        // Server redirects forever; budget 2 means exactly 2 redirects are
        // followed (3 exchanges), then failure.
        let channel = ScriptedChannel::new(vec![
            redirect(302, "/a"),
            redirect(302, "/b"),
            redirect(302, "/c"),
            redirect(302, "/d"),
        ]);
        let client = client_over(channel.clone());

        let failed = Arc::new(AtomicUsize::new(0));
        let listener_failed = failed.clone();
        let result = client
            .get("http://example.com/")
            .max_redirects(2)
            .on_exception(move |_| {
                listener_failed.fetch_add(1, Ordering::SeqCst);
            })
            .send()
            .await;

        assert!(matches!(result, Err(TransportError::TooManyRedirects)));
        assert_eq!(channel.recorded().len(), 3);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redirect_not_followed_when_disabled() {
        let channel = ScriptedChannel::new(vec![redirect(302, "/next")]);
        let client = client_over(channel.clone());

        let response = client
            .get("http://example.com/")
            .follow_redirects(false)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(channel.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_redirect_without_location_is_terminal() {
        let response = Response::builder().status(300).body(Bytes::new()).unwrap();
        let channel = ScriptedChannel::new(vec![response]);
        let client = client_over(channel.clone());

        let response = client.get("http://example.com/").send().await.unwrap();
        assert_eq!(response.status().as_u16(), 300);
    }

    #[tokio::test]
    async fn test_cookies_replayed_on_derived_request() {
        let with_cookie = Response::builder()
            .status(302)
            .header(header::LOCATION, "/authed")
            .header(header::SET_COOKIE, "session=abc; Path=/")
            .body(Bytes::new())
            .unwrap();
        let channel = ScriptedChannel::new(vec![with_cookie, ok("done")]);
        let client = client_over(channel.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener_seen = seen.clone();
        client
            .get("http://example.com/login")
            .on_cookie(move |cookie| listener_seen.lock().unwrap().push(cookie.clone()))
            .send()
            .await
            .unwrap();

        let recorded = channel.recorded();
        let cookie_header = recorded[1].2.get(header::COOKIE).unwrap();
        assert_eq!(cookie_header, "session=abc");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_context_fails_without_dialing() {
        struct PanickingConnector;

        #[async_trait]
        impl Connector for PanickingConnector {
            async fn connect(&self, _node: &NodeAddress) -> ConnectorResult<Arc<dyn Channel>> {
                panic!("expired exchange must not consume a connection");
            }
        }

        let client = Client::builder(Arc::new(PanickingConnector)).build();
        let result = client
            .get("http://example.com/")
            .timeout(Duration::from_millis(0))
            .send()
            .await;

        assert!(matches!(result, Err(TransportError::TimedOut)));
    }

    #[tokio::test]
    async fn test_channel_failure_settles_context_with_cause() {
        // Empty script: first exchange reports the connection inactive.
        let channel = ScriptedChannel::new(Vec::new());
        let client = client_over(channel);

        let context = client
            .get("http://example.com/")
            .dispatch()
            .unwrap();
        let outcome = context.completed().await;

        assert!(context.failed());
        assert_eq!(
            outcome,
            crate::core::context::ExchangeOutcome::Failed("channel inactive".to_string())
        );
    }

    #[tokio::test]
    async fn test_configured_nodes_rotate_for_initial_dispatch() {
        struct RecordingConnector {
            dialed: Mutex<Vec<NodeAddress>>,
            channel: Arc<ScriptedChannel>,
        }

        #[async_trait]
        impl Connector for RecordingConnector {
            async fn connect(&self, node: &NodeAddress) -> ConnectorResult<Arc<dyn Channel>> {
                self.dialed.lock().unwrap().push(node.clone());
                Ok(self.channel.clone())
            }
        }

        let connector = Arc::new(RecordingConnector {
            dialed: Mutex::new(Vec::new()),
            channel: ScriptedChannel::new(vec![ok("a"), ok("b")]),
        });
        let replica_one = NodeAddress::new("replica-1", 80, ProtocolVersion::Http1, false);
        let replica_two = NodeAddress::new("replica-2", 80, ProtocolVersion::Http1, false);
        let client = Client::builder(connector.clone())
            .node(replica_one.clone())
            .node(replica_two.clone())
            .build();

        client.get("http://service.example.com/").send().await.unwrap();
        client.get("http://service.example.com/").send().await.unwrap();

        let dialed = connector.dialed.lock().unwrap().clone();
        assert_eq!(dialed, vec![replica_one, replica_two]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_returns_waitable_context() {
        let channel = ScriptedChannel::new(vec![ok("done")]);
        let client = client_over(channel);

        let context = client.get("http://example.com/").dispatch().unwrap();
        let outcome = context
            .wait_timeout(Duration::from_secs(5))
            .expect("exchange should settle");
        assert_eq!(outcome, crate::core::context::ExchangeOutcome::Succeeded);
        assert!(context.succeeded());
    }
}
