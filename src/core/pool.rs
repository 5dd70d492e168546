//! Bounded, retrying connection pool.
//!
//! One counting permit pool (a semaphore sized to the aggregate connection
//! limit) is shared across all configured nodes: the number of connections
//! simultaneously in use never exceeds the limit, under concurrent
//! acquire/release from any mix of tasks. Acquisition blocks until a permit
//! is available or the pool timeout elapses. Node selection is round-robin
//! across configured nodes; a failed connection attempt rotates to the next
//! node, up to the retry budget, before a pool-exhausted failure surfaces.
//!
//! Release is guard-based: dropping a [`PooledConnection`] returns the permit
//! and, unless the connection was marked failed, returns the channel to the
//! reusable set. A connection that errored is discarded and replaced lazily
//! on a later acquisition. HTTP/2 channels are cached as shared handles,
//! cloned per acquisition and evicted once the connection reports closed.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    core::address::NodeAddress,
    ports::connection::{Channel, Connector},
};

/// Errors surfaced by pool operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PoolError {
    /// All retry attempts were consumed, or no permit became available
    /// within the pool timeout
    #[error("Connection pool exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// Acquire was called after `close()`
    #[error("Connection pool is shutting down")]
    ShuttingDown,

    /// The pool was configured without any node to rotate over
    #[error("Connection pool has no configured nodes")]
    NoNodes,
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Immutable pool sizing, constructed once and threaded through by value.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Aggregate limit on concurrently in-use connections
    pub limit: usize,
    /// Connection attempts per acquisition before surfacing failure
    pub retry_budget: u32,
    /// Upper bound on waiting for a permit
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit: 8,
            retry_budget: 3,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

enum IdleEntry {
    /// HTTP/1: exclusive reuse, one holder at a time
    Exclusive(VecDeque<Arc<dyn Channel>>),
    /// HTTP/2: one shared multiplexed channel, cloned per acquisition
    Shared(Arc<dyn Channel>),
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    nodes: Vec<NodeAddress>,
    cursor: AtomicUsize,
    idle: Mutex<HashMap<NodeAddress, IdleEntry>>,
    config: PoolConfig,
    closed: AtomicBool,
}

impl PoolInner {
    fn recycle(&self, node: &NodeAddress, channel: Arc<dyn Channel>, failed: bool) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if channel.is_multiplexed() {
            // Shared channels stay cached while open; a failed or closed one
            // is evicted so the next acquisition dials fresh.
            if failed || !channel.is_open() {
                idle.remove(node);
            }
            return;
        }

        if failed || !channel.is_open() || self.closed.load(Ordering::Acquire) {
            return;
        }

        match idle
            .entry(node.clone())
            .or_insert_with(|| IdleEntry::Exclusive(VecDeque::new()))
        {
            IdleEntry::Exclusive(queue) => queue.push_back(channel),
            IdleEntry::Shared(_) => {}
        }
    }

    fn checkout_idle(&self, node: &NodeAddress) -> Option<Arc<dyn Channel>> {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match idle.get_mut(node) {
            Some(IdleEntry::Exclusive(queue)) => {
                // Closed entries are discarded here and replaced lazily.
                while let Some(channel) = queue.pop_front() {
                    if channel.is_open() {
                        return Some(channel);
                    }
                }
                None
            }
            Some(IdleEntry::Shared(channel)) => {
                if channel.is_open() {
                    Some(channel.clone())
                } else {
                    idle.remove(node);
                    None
                }
            }
            None => None,
        }
    }

    fn cache_shared(&self, node: &NodeAddress, channel: Arc<dyn Channel>) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        idle.insert(node.clone(), IdleEntry::Shared(channel));
    }
}

/// A concurrency-limited, retrying connection cache shared across one or
/// more node addresses.
#[derive(Clone)]
pub struct BoundedConnectionPool {
    inner: Arc<PoolInner>,
}

impl BoundedConnectionPool {
    /// Create a pool over the given nodes. The node list may be empty when
    /// every acquisition names its destination via
    /// [`acquire_to`](Self::acquire_to).
    pub fn new(connector: Arc<dyn Connector>, nodes: Vec<NodeAddress>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                permits: Arc::new(Semaphore::new(config.limit)),
                nodes,
                cursor: AtomicUsize::new(0),
                idle: Mutex::new(HashMap::new()),
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire a connection, rotating round-robin over the configured nodes.
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        if self.inner.nodes.is_empty() {
            return Err(PoolError::NoNodes);
        }
        let permit = self.obtain_permit().await?;
        self.connect_with_budget(permit, None).await
    }

    /// Acquire a connection to a specific node. Retries stay on that node.
    pub async fn acquire_to(&self, node: &NodeAddress) -> PoolResult<PooledConnection> {
        let permit = self.obtain_permit().await?;
        self.connect_with_budget(permit, Some(node.clone())).await
    }

    /// Whether any nodes were configured for rotation.
    pub fn has_nodes(&self) -> bool {
        !self.inner.nodes.is_empty()
    }

    /// Number of connections currently in use. Never exceeds the limit.
    pub fn in_use(&self) -> usize {
        self.inner.config.limit - self.inner.permits.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.inner.config.limit
    }

    /// Shut the pool down: pending and future acquisitions fail fast and the
    /// reusable set is dropped.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let mut idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        idle.clear();
        tracing::debug!("Connection pool closed");
    }

    async fn obtain_permit(&self) -> PoolResult<OwnedSemaphorePermit> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }

        match tokio::time::timeout(
            self.inner.config.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore only closes on shutdown.
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => Err(PoolError::Exhausted {
                attempts: 0,
                last_error: "timed out waiting for a pool permit".to_string(),
            }),
        }
    }

    async fn connect_with_budget(
        &self,
        permit: OwnedSemaphorePermit,
        pinned: Option<NodeAddress>,
    ) -> PoolResult<PooledConnection> {
        let inner = &self.inner;
        let attempts = inner.config.retry_budget.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 0..attempts {
            let node = match &pinned {
                Some(node) => node.clone(),
                None => {
                    let index = inner.cursor.fetch_add(1, Ordering::Relaxed) % inner.nodes.len();
                    inner.nodes[index].clone()
                }
            };

            if let Some(channel) = inner.checkout_idle(&node) {
                return Ok(PooledConnection::new(self.inner.clone(), node, channel, permit));
            }

            match inner.connector.connect(&node).await {
                Ok(channel) => {
                    if channel.is_multiplexed() {
                        inner.cache_shared(&node, channel.clone());
                    }
                    return Ok(PooledConnection::new(self.inner.clone(), node, channel, permit));
                }
                Err(e) => {
                    tracing::debug!(
                        node = %node,
                        attempt = attempt + 1,
                        error = %e,
                        "Connection attempt failed, rotating"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        // Dropping the permit here returns it before the failure surfaces.
        drop(permit);
        Err(PoolError::Exhausted {
            attempts,
            last_error: last_error.unwrap_or_else(|| "no idle connection".to_string()),
        })
    }
}

/// A connection checked out of the pool.
///
/// Holds one permit for its lifetime; dropping the guard releases the permit
/// and returns the channel to the reusable set unless
/// [`mark_failed`](Self::mark_failed) was called.
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    node: NodeAddress,
    channel: Arc<dyn Channel>,
    failed: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("node", &self.node)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(
        inner: Arc<PoolInner>,
        node: NodeAddress,
        channel: Arc<dyn Channel>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            inner,
            node,
            channel,
            failed: AtomicBool::new(false),
            _permit: permit,
        }
    }

    pub fn node(&self) -> &NodeAddress {
        &self.node
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Mark the connection unusable; it will be discarded on release instead
    /// of returned to the pool.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let failed = self.failed.load(Ordering::Acquire);
        self.inner
            .recycle(&self.node, self.channel.clone(), failed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, Response};

    use super::*;
    use crate::{
        core::address::ProtocolVersion,
        ports::connection::{ChannelResult, ConnectorError, ConnectorResult},
    };

    struct StubChannel {
        open: AtomicBool,
        multiplexed: bool,
    }

    impl StubChannel {
        fn new(multiplexed: bool) -> Self {
            Self {
                open: AtomicBool::new(true),
                multiplexed,
            }
        }
    }

    #[async_trait]
    impl Channel for StubChannel {
        async fn exchange(&self, _req: Request<Bytes>) -> ChannelResult<Response<Bytes>> {
            Ok(Response::new(Bytes::new()))
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn is_multiplexed(&self) -> bool {
            self.multiplexed
        }
    }

    struct StubConnector {
        dials: AtomicU32,
        fail_first: u32,
        multiplexed: bool,
    }

    impl StubConnector {
        fn reliable() -> Self {
            Self {
                dials: AtomicU32::new(0),
                fail_first: 0,
                multiplexed: false,
            }
        }

        fn failing_first(n: u32) -> Self {
            Self {
                dials: AtomicU32::new(0),
                fail_first: n,
                multiplexed: false,
            }
        }

        fn shared() -> Self {
            Self {
                dials: AtomicU32::new(0),
                fail_first: 0,
                multiplexed: true,
            }
        }
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(&self, node: &NodeAddress) -> ConnectorResult<Arc<dyn Channel>> {
            let dial = self.dials.fetch_add(1, Ordering::SeqCst);
            if dial < self.fail_first {
                return Err(ConnectorError::Unreachable {
                    node: node.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Arc::new(StubChannel::new(self.multiplexed)))
        }
    }

    fn node(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port, ProtocolVersion::Http1, false)
    }

    fn pool_with(connector: StubConnector, nodes: Vec<NodeAddress>, config: PoolConfig) -> BoundedConnectionPool {
        BoundedConnectionPool::new(Arc::new(connector), nodes, config)
    }

    #[tokio::test]
    async fn test_in_use_never_exceeds_limit() {
        let pool = pool_with(
            StubConnector::reliable(),
            vec![node(1)],
            PoolConfig {
                limit: 2,
                ..PoolConfig::default()
            },
        );

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        drop(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let pool = pool_with(
            StubConnector::reliable(),
            vec![node(1)],
            PoolConfig {
                limit: 1,
                acquire_timeout: Duration::from_secs(5),
                ..PoolConfig::default()
            },
        );

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_permit_timeout_surfaces_exhausted() {
        let pool = pool_with(
            StubConnector::reliable(),
            vec![node(1)],
            PoolConfig {
                limit: 1,
                acquire_timeout: Duration::from_millis(20),
                ..PoolConfig::default()
            },
        );

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn test_retry_rotates_past_failing_node() {
        let pool = pool_with(
            StubConnector::failing_first(1),
            vec![node(1), node(2)],
            PoolConfig {
                retry_budget: 2,
                ..PoolConfig::default()
            },
        );

        // First dial fails, rotation reaches the second node within budget.
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_budget_consumed_surfaces_exhausted_with_cause() {
        let pool = pool_with(
            StubConnector::failing_first(u32::MAX),
            vec![node(1), node(2)],
            PoolConfig {
                retry_budget: 3,
                ..PoolConfig::default()
            },
        );

        match pool.acquire().await {
            Err(PoolError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        // The failed acquisition returned its permit.
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let counting = Arc::new(StubConnector::reliable());
        let pool =
            BoundedConnectionPool::new(counting.clone(), vec![node(1)], PoolConfig::default());

        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());

        // One dial served both acquisitions.
        assert_eq!(counting.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connection_is_discarded_not_reused() {
        let counting = Arc::new(StubConnector::reliable());
        let pool = BoundedConnectionPool::new(counting.clone(), vec![node(1)], PoolConfig::default());

        let conn = pool.acquire().await.unwrap();
        conn.mark_failed();
        drop(conn);

        drop(pool.acquire().await.unwrap());
        assert_eq!(counting.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_multiplexed_channel_shared_across_acquisitions() {
        let counting = Arc::new(StubConnector::shared());
        let pool = BoundedConnectionPool::new(
            counting.clone(),
            vec![NodeAddress::new("127.0.0.1", 1, ProtocolVersion::Http2, false)],
            PoolConfig {
                limit: 4,
                ..PoolConfig::default()
            },
        );

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(Arc::ptr_eq(a.channel(), b.channel()));
        assert_eq!(counting.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails_fast() {
        let pool = pool_with(StubConnector::reliable(), vec![node(1)], PoolConfig::default());
        pool.close();
        assert!(matches!(pool.acquire().await, Err(PoolError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_acquire_to_pins_destination() {
        let pool = pool_with(
            StubConnector::reliable(),
            Vec::new(),
            PoolConfig::default(),
        );
        let target = node(9);
        let conn = pool.acquire_to(&target).await.unwrap();
        assert_eq!(conn.node(), &target);

        // Rotation requires configured nodes.
        assert!(matches!(pool.acquire().await, Err(PoolError::NoNodes)));
    }
}
