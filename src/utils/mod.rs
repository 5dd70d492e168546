pub mod connection_tracker;

pub use connection_tracker::{ConnectionRecord, ConnectionTracker, ExchangeGuard};
