//! Arbor - a dual-sided HTTP routing and connection-management toolkit.
//!
//! Arbor provides the two halves of an HTTP deployment that sit between
//! application code and the byte-level transport:
//!
//! * a **server side** that resolves inbound requests through virtual hosts
//!   and ordered endpoint matchers to user-supplied dispatchers, and
//! * a **client side** that executes request/response exchanges over a
//!   bounded connection pool, with redirect following, retry budgets and
//!   per-exchange completion signaling.
//!
//! # Features
//! - Virtual-host routing with aliases and a wildcard default host
//! - Prefix + glob endpoint matching with path-parameter extraction
//! - Per-endpoint method / content-type restriction and pre-dispatch filters
//! - TLS virtual hosting: per-name certificate selection via SNI, ALPN-driven
//!   HTTP/1 vs HTTP/2 pipeline selection
//! - Bounded connection pooling with round-robin node rotation and a
//!   configurable retry budget
//! - Client redirect following with exact budgets, shared cookie jars and
//!   response/exception/cookie listeners
//! - Configuration loading (YAML / JSON / TOML) with startup validation
//! - Structured tracing via `tracing`, graceful shutdown & connection
//!   tracking
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use arbor::core::{
//!     Endpoint, EndpointResolver, NodeAddress, ProtocolVersion, RoutingTable, ServerEngine,
//!     VirtualHost, WILDCARD_NAME,
//! };
//!
//! # fn main() -> eyre::Result<()> {
//! let endpoint = Endpoint::builder("/static").pattern("/**").build()?;
//! let resolver = EndpointResolver::new(
//!     vec![endpoint],
//!     arbor::adapters::static_dir_dispatcher("./static", "/static"),
//! );
//! let host = VirtualHost::builder(WILDCARD_NAME)
//!     .address(NodeAddress::new("127.0.0.1", 8080, ProtocolVersion::Http1, false))
//!     .resolver(resolver)
//!     .build()?;
//! let table = RoutingTable::builder().host(host).build()?;
//! let engine = ServerEngine::new(Arc::new(table));
//! // Wire the engine into the provided server adapter (see adapters::Server)
//! # let _ = engine;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits onto the byte-level transport and
//! connection-establishment collaborators) from **adapters** (tokio / hyper /
//! rustls implementations) while keeping the routing and lifecycle logic
//! inside `core`. End users should prefer the re-exports documented below
//! instead of reaching into internal modules directly.
//!
//! # Error Handling
//! All fallible APIs return a domain specific error type or `eyre::Result<T>`
//! at composition boundaries. Failures of a client exchange are additionally
//! reported through its `RequestContext` and any registered exception
//! listener, never via process exit codes.
//!
//! # Concurrency
//! Pool permits, redirect counters and completion signals are safe under
//! concurrent access from I/O-driving tasks and caller threads. The only
//! blocking waits exposed to callers are pool acquisition (bounded by the
//! pool timeout) and `RequestContext::wait`/`wait_timeout`.
//!
//! # License
//! Licensed under Apache-2.0.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types most embedders need
pub use crate::{
    adapters::{HyperConnector, Server, static_dir_dispatcher},
    core::{
        BoundedConnectionPool, Client, Endpoint, EndpointResolver, NodeAddress, RequestContext,
        RoutingTable, ServerEngine, VirtualHost,
    },
    ports::{Channel, Connector},
    utils::ConnectionTracker,
};
