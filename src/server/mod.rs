//! Tokio-based TCP server running one [`Connection`](crate::connection::Connection)
//! per accepted socket.
//!
//! `AmqpServer` spawns worker tasks that accept connections from a shared
//! listener. Every connection shares the same broker, authenticator and
//! [`EngineConfig`].

use std::sync::Arc;

use tokio::{net::TcpListener, sync::oneshot};

use crate::{broker::Broker, config::EngineConfig, sasl::Authenticator};

/// TCP server for the protocol engine.
///
/// The server carries a typestate `S` indicating whether it is [`Unbound`]
/// (not yet bound to a TCP listener) or [`Bound`]. New servers start
/// `Unbound` and must call [`AmqpServer::bind`] or
/// [`AmqpServer::bind_existing_listener`] before running.
pub struct AmqpServer<S = Unbound>
where
    S: ServerState,
{
    pub(crate) context: ConnectionContext,
    pub(crate) workers: usize,
    /// Channel used to notify when the server is ready.
    ///
    /// A `oneshot::Sender` can transmit only one readiness notification, so a
    /// new sender must be provided each time the server is started.
    pub(crate) ready_tx: Option<oneshot::Sender<()>>,
    pub(crate) backoff_config: BackoffConfig,
    /// Typestate tracking whether the server has been bound to a listener.
    pub(crate) state: S,
}

/// Everything a connection task needs besides its socket.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) config: Arc<EngineConfig>,
}

/// Marker indicating the server has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the server is bound to a TCP listener.
#[derive(Debug, Clone)]
pub struct Bound {
    pub(crate) listener: Arc<TcpListener>,
}

/// Trait implemented by [`Unbound`] and [`Bound`] to model binding typestate.
pub trait ServerState: sealed::Sealed {}

mod sealed {
    //! Prevent external implementations of [`ServerState`].

    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

mod config;
mod connection;
pub mod error;
mod runtime;

pub use error::ServerError;
/// Re-exported configuration types for server backoff behaviour.
pub use runtime::BackoffConfig;

#[cfg(test)]
pub(crate) mod test_util;
