//! Builder methods and listener binding for [`AmqpServer`].

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
};

use tokio::{net::TcpListener, sync::oneshot};

use super::{AmqpServer, BackoffConfig, Bound, ConnectionContext, ServerError, ServerState, Unbound};
use crate::{
    broker::Broker,
    config::EngineConfig,
    sasl::{AnonymousAuthenticator, Authenticator},
};

impl AmqpServer<Unbound> {
    /// Create a server handing connections to `broker`.
    ///
    /// The worker count defaults to the number of available CPU cores (or 1
    /// if this cannot be determined). Peers authenticate anonymously and the
    /// default [`EngineConfig`] applies until overridden.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            context: ConnectionContext {
                broker,
                authenticator: Arc::new(AnonymousAuthenticator),
                config: Arc::new(EngineConfig::default()),
            },
            workers,
            ready_tx: None,
            backoff_config: BackoffConfig::default(),
            state: Unbound,
        }
    }

    /// Return `None` as the server is not bound.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use amqpframe::{broker::MemoryBroker, server::AmqpServer};
    ///
    /// assert!(AmqpServer::new(Arc::new(MemoryBroker::new())).local_addr().is_none());
    /// ```
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> { None }

    /// Bind to a fresh address.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::{
    ///     net::{Ipv4Addr, SocketAddr},
    ///     sync::Arc,
    /// };
    ///
    /// use amqpframe::{broker::MemoryBroker, server::AmqpServer};
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    /// let server = AmqpServer::new(Arc::new(MemoryBroker::new()))
    ///     .bind(addr)
    ///     .expect("bind failed");
    /// assert!(server.local_addr().is_some());
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if binding or configuring the listener
    /// fails.
    pub fn bind(self, addr: SocketAddr) -> Result<AmqpServer<Bound>, ServerError> {
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_existing_listener(std_listener)
    }

    /// Bind to an existing `StdTcpListener`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if configuring the listener fails.
    pub fn bind_existing_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<AmqpServer<Bound>, ServerError> {
        std_listener
            .set_nonblocking(true)
            .map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(std_listener).map_err(ServerError::Bind)?;
        let Self {
            context,
            workers,
            ready_tx,
            backoff_config,
            ..
        } = self;
        Ok(AmqpServer {
            context,
            workers,
            ready_tx,
            backoff_config,
            state: Bound {
                listener: Arc::new(listener),
            },
        })
    }
}

impl<S> AmqpServer<S>
where
    S: ServerState,
{
    /// Set the number of worker tasks to spawn for the server.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    /// Judge SASL exchanges with `authenticator`.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.context.authenticator = authenticator;
        self
    }

    /// Replace the engine configuration shared by every connection.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.context.config = Arc::new(config);
        self
    }

    /// Configure a channel used to signal when the server is ready to accept
    /// connections.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// Configure the exponential back-off applied when `accept()` fails.
    ///
    /// The configuration is normalized before use.
    #[must_use]
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff_config = backoff.normalized();
        self
    }

    /// Returns the configured number of worker tasks for the server.
    #[inline]
    #[must_use]
    pub const fn worker_count(&self) -> usize { self.workers }

    /// Engine configuration handed to each connection.
    #[must_use]
    pub fn config(&self) -> &EngineConfig { &self.context.config }
}

impl AmqpServer<Bound> {
    /// Returns the bound address, or `None` if retrieving it fails.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.state.listener.local_addr().ok() }
}
