//! Accepted-connection tracking and graceful draining for the server
//! adapter.
//!
//! Each accepted TCP connection is registered with a record carrying its
//! active exchange count and age. During shutdown the tracker broadcasts a
//! stop signal and waits, bounded by a timeout, for in-flight exchanges to
//! finish.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use tokio::{sync::broadcast, time::sleep};

/// Unique identifier for a tracked connection
pub type ConnectionId = u64;

/// Record of one accepted connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    accepted_at: Instant,
    active_exchanges: AtomicU64,
}

impl ConnectionRecord {
    fn new(id: ConnectionId, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            accepted_at: Instant::now(),
            active_exchanges: AtomicU64::new(0),
        }
    }

    /// Register one in-flight exchange; the guard ends it on drop.
    pub fn begin_exchange(self: &Arc<Self>) -> ExchangeGuard {
        self.active_exchanges.fetch_add(1, Ordering::Relaxed);
        ExchangeGuard {
            record: self.clone(),
        }
    }

    pub fn active_exchanges(&self) -> u64 {
        self.active_exchanges.load(Ordering::Relaxed)
    }

    pub fn is_idle(&self) -> bool {
        self.active_exchanges() == 0
    }

    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }
}

/// RAII marker for one in-flight exchange on a connection.
pub struct ExchangeGuard {
    record: Arc<ConnectionRecord>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.record.active_exchanges.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Registry of accepted connections with graceful draining.
#[derive(Clone)]
pub struct ConnectionTracker {
    connections: Arc<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
    next_id: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            connections: Arc::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown_tx,
        }
    }

    /// Register an accepted connection and return its record.
    pub fn register(&self, remote_addr: SocketAddr) -> Arc<ConnectionRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ConnectionRecord::new(id, remote_addr));
        let _ = self.connections.insert_sync(id, record.clone());
        tracing::debug!(id, %remote_addr, total = self.connections.len(), "Connection registered");
        record
    }

    /// Remove a connection from the registry.
    pub fn unregister(&self, id: ConnectionId) {
        if let Some((_, record)) = self.connections.remove_sync(&id) {
            tracing::debug!(id, age = ?record.age(), "Connection unregistered");
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Sum of in-flight exchanges across all connections.
    pub fn active_exchanges(&self) -> u64 {
        let mut total = 0;
        self.connections.retain_sync(|_, record| {
            total += record.active_exchanges();
            true
        });
        total
    }

    /// Broadcast the shutdown signal to subscribers.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait until every connection is idle or the timeout elapses. Returns
    /// whether the drain completed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            if self.active_exchanges() == 0 {
                return true;
            }
            sleep(interval).await;
            interval = std::cmp::min(interval * 2, Duration::from_secs(1));
        }

        tracing::warn!(
            remaining = self.active_exchanges(),
            "Drain timeout exceeded with exchanges still in flight"
        );
        false
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
