pub mod address;
pub mod context;
pub mod endpoint;
pub mod pool;
pub mod resolver;
pub mod routing;
pub mod server;
pub mod transport;
pub mod vhost;

pub use address::{NodeAddress, ProtocolVersion};
pub use context::{Cookie, ExchangeOutcome, RequestContext};
pub use endpoint::{Endpoint, EndpointBuilder, PathParams};
pub use pool::{BoundedConnectionPool, PoolConfig, PooledConnection};
pub use resolver::{EndpointResolver, ResolvedRequest};
pub use routing::{RoutingTable, RoutingTableBuilder, WILDCARD_NAME};
pub use server::ServerEngine;
pub use transport::{Client, ClientBuilder, ClientDefaults, RequestBuilder};
pub use vhost::{TlsIdentity, VirtualHost, VirtualHostBuilder};
