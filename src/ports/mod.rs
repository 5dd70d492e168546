pub mod connection;

pub use connection::{Channel, Connector};
