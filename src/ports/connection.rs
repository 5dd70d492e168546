use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use thiserror::Error;

use crate::core::address::NodeAddress;

/// Errors raised while establishing a connection to a node
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectorError {
    /// The node refused or never answered the connection attempt
    #[error("Node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    /// The TLS handshake with the node failed
    #[error("TLS handshake with {node} failed: {reason}")]
    Handshake { node: String, reason: String },

    /// The protocol-level handshake (HTTP/1 or HTTP/2) failed
    #[error("Protocol handshake with {node} failed: {reason}")]
    Protocol { node: String, reason: String },
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors raised by a channel while exchanging one message pair
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChannelError {
    /// The underlying connection went inactive before a response arrived
    #[error("channel inactive")]
    Inactive,

    /// The byte-level transport surfaced an error while reading or writing
    #[error("Wire error: {0}")]
    Wire(String),

    /// The message could not be converted to or from the wire representation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel defines the port onto the external byte-level transport/codec
/// collaborator for one established connection.
///
/// `exchange` corresponds to the collaborator's write operation plus its
/// decode notification: it accepts a fully-formed request and resolves with
/// the decoded response. `is_open` reflects the collaborator's
/// connection-closed notification. An HTTP/2 channel accepts concurrent
/// `exchange` calls, multiplexed as independent streams; an HTTP/1 channel
/// serializes them.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Write one request and await its decoded response.
    async fn exchange(&self, req: Request<Bytes>) -> ChannelResult<Response<Bytes>>;

    /// Whether the underlying connection is still usable.
    fn is_open(&self) -> bool;

    /// Whether this channel multiplexes concurrent exchanges over one
    /// connection (HTTP/2 streams).
    fn is_multiplexed(&self) -> bool {
        false
    }

    /// The stream identifier assigned to the most recent exchange, for
    /// multiplexed channels.
    fn next_stream_id(&self) -> Option<u64> {
        None
    }
}

/// Connector defines the port for establishing a channel to a node,
/// covering the socket and TLS collaborators.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a connection to the node and return its channel.
    async fn connect(&self, node: &NodeAddress) -> ConnectorResult<Arc<dyn Channel>>;
}
