//! Public API for the `amqpframe` library.
//!
//! This crate implements the wire-protocol engine of a message broker: the
//! protocol header and optional SASL exchange, the connection and session
//! state machines, and publish/subscribe links that move messages between a
//! peer and a pluggable [`broker::Broker`]. [`server::AmqpServer`] runs one
//! [`Connection`] per accepted TCP socket.

pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod header;
pub mod link;
pub mod metrics;
pub mod performative;
pub mod sasl;
pub mod server;
pub mod session;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::{DispositionMode, EngineConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::EngineError;
pub use metrics::{CONNECTIONS_ACTIVE, DELIVERIES_SETTLED, Direction, ERRORS_TOTAL, FRAMES_PROCESSED};
