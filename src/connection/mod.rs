//! Connection engine.
//!
//! A [`Connection`] owns one transport, the protocol state machine, the
//! session running on it and the channel broker callbacks post into. It is
//! driven by a single task: each call to
//! [`process_next`](Connection::process_next) awaits the next input, either a
//! protocol unit from the peer or a broker event, and handles it to
//! completion before returning. The socket is polled ahead of broker events
//! with `tokio::select!`'s `biased` mode, so a busy broker cannot starve
//! the peer's frames.

mod counter;
mod dispatch;
mod event;
mod shutdown;
mod state;


use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use counter::ActiveConnection;
pub use counter::active_connection_count;
use event::Input;
use futures::{SinkExt, StreamExt};
pub use state::ConnectionState;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, warn};

use crate::{
    broker::{Broker, EventReceiver, EventSender},
    codec::{AmqpCodec, Frame, Outbound},
    config::EngineConfig,
    error::EngineError,
    metrics::{self, Direction},
    sasl::{AnonymousAuthenticator, Authenticator},
    session::Session,
};

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Allocate the next process-unique identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the inner `u64` representation.
    #[must_use]
    pub const fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ConnectionId({})", self.0) }
}

/// Protocol engine for one transport.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use amqpframe::{broker::MemoryBroker, config::EngineConfig, connection::Connection};
/// use tokio::net::TcpListener;
///
/// # async fn serve() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Arc::new(MemoryBroker::new().auto_create(true));
/// let config = Arc::new(EngineConfig::default());
/// let listener = TcpListener::bind("127.0.0.1:5672").await?;
/// let (stream, _) = listener.accept().await?;
/// Connection::new(stream, broker, config).run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection<S> {
    id: ConnectionId,
    framed: Framed<S, AmqpCodec>,
    state: ConnectionState,
    session: Option<Session>,
    broker: Arc<dyn Broker>,
    authenticator: Arc<dyn Authenticator>,
    config: Arc<EngineConfig>,
    events: EventSender,
    events_rx: EventReceiver,
    outbox: Vec<Frame>,
    shutdown: CancellationToken,
    counter: Option<ActiveConnection>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create an engine for `stream`.
    ///
    /// Peers authenticate anonymously unless an authenticator is set with
    /// [`with_authenticator`](Self::with_authenticator).
    #[must_use]
    pub fn new(stream: S, broker: Arc<dyn Broker>, config: Arc<EngineConfig>) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            id: ConnectionId::next(),
            framed: Framed::new(stream, AmqpCodec::new(config.max_frame_size)),
            state: ConnectionState::New,
            session: None,
            broker,
            authenticator: Arc::new(AnonymousAuthenticator),
            config,
            events,
            events_rx,
            outbox: Vec::new(),
            shutdown: CancellationToken::new(),
            counter: None,
        }
    }

    /// Use `authenticator` to judge SASL exchanges.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Close the connection gracefully once `token` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Identifier used in logs.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// Current protocol state.
    #[must_use]
    pub fn state(&self) -> ConnectionState { self.state }

    /// The session running on this connection, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Session> { self.session.as_ref() }

    /// Register the connection as active.
    ///
    /// Called once before the first [`process_next`](Self::process_next).
    pub fn on_connection_start(&mut self) {
        if self.counter.is_none() {
            self.counter = Some(ActiveConnection::register(self.id));
        }
    }

    /// Drive the connection to completion.
    ///
    /// Runs [`on_connection_start`](Self::on_connection_start), then
    /// [`process_next`](Self::process_next) until the connection closes, then
    /// [`on_connection_close`](Self::on_connection_close). A failure after
    /// `Open` is reported to the peer in a `Close` frame before the transport
    /// is shut down.
    ///
    /// # Errors
    ///
    /// Returns the [`EngineError`] that ended the connection.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.on_connection_start();
        let result = loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(error) => break Err(error),
            }
        };
        if let Err(error) = &result {
            self.report(error).await;
        }
        self.on_connection_close().await;
        result
    }

    /// Consume and handle exactly one input.
    ///
    /// Returns `false` once the connection is closed and no further input
    /// will be read.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the peer violated the protocol or the
    /// transport failed. The connection must then be closed.
    pub async fn process_next(&mut self) -> Result<bool, EngineError> {
        if self.state == ConnectionState::Closed {
            return Ok(false);
        }
        match self.next_input().await? {
            Input::Unit(unit) => self.on_unit(unit).await?,
            Input::Broker(event) => self.on_broker_event(event)?,
            Input::Shutdown => self.on_shutdown(),
            Input::Eof => {
                debug!(connection_id = %self.id, state = %self.state, "peer closed the transport");
                self.state = ConnectionState::Closed;
            }
        }
        self.flush().await?;
        Ok(self.state != ConnectionState::Closed)
    }

    /// Await the next input, shutdown first, then the socket, then the
    /// broker.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn next_input(&mut self) -> Result<Input, EngineError> {
        let watching_shutdown = self.state == ConnectionState::Open;
        tokio::select! {
            biased;

            () = self.shutdown.cancelled(), if watching_shutdown => Ok(Input::Shutdown),
            unit = self.framed.next() => match unit {
                Some(unit) => Ok(Input::Unit(unit?)),
                None => Ok(Input::Eof),
            },
            Some(event) = self.events_rx.recv() => Ok(Input::Broker(event)),
        }
    }

    /// Queue a frame for the next flush.
    fn send(&mut self, frame: Frame) { self.outbox.push(frame); }

    /// Write queued frames to the transport.
    async fn flush(&mut self) -> Result<(), EngineError> {
        for frame in self.outbox.drain(..) {
            if let Some(performative) = frame.performative() {
                debug!(
                    connection_id = %self.id,
                    channel = frame.channel,
                    frame = performative.name(),
                    "sending frame"
                );
            }
            self.framed.feed(Outbound::Frame(frame)).await?;
            metrics::inc_frames(Direction::Outbound);
        }
        self.framed.flush().await.map_err(|error| {
            warn!(connection_id = %self.id, %error, "flush failed");
            EngineError::from(error)
        })
    }
}
