#![cfg(any(test, feature = "test-helpers"))]
//! Test-only helpers shared by unit and integration tests.
//!
//! [`RecordingBroker`] stands in for a real broker and records every call the
//! engine makes. [`TestPeer`] plays the client side of a connection over an
//! in-memory duplex stream.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    broker::{
        Broker,
        BrokerError,
        MessageHandler,
        MessageId,
        Publisher,
        SettleCallback,
        Settlement,
        Subscriber,
        TxId,
    },
    codec::{AmqpCodec, Frame, FrameBody, Inbound, Outbound},
    config::EngineConfig,
    connection::Connection,
    error::EngineError,
    header::ProtocolHeader,
    performative::{
        Attach,
        Begin,
        DeliveryState,
        ErrorCondition,
        Flow,
        Open,
        Performative,
        Role,
        SaslFrame,
        Source,
        Target,
        Transfer,
    },
    sasl::Authenticator,
};

/// A message published through a [`RecordingBroker`].
#[derive(Clone, Debug)]
pub struct Published {
    /// Address of the publish link.
    pub address: String,
    /// Identifier the broker assigned.
    pub message_id: MessageId,
    /// Message bytes.
    pub body: Bytes,
}

#[derive(Default)]
struct Recorded {
    refused: HashSet<String>,
    manual_settlement: bool,
    next_id: u64,
    published: Vec<Published>,
    unsettled: HashMap<MessageId, SettleCallback>,
    handlers: HashMap<String, MessageHandler>,
    flows: Vec<(String, u32, u32)>,
    outcomes: Vec<(MessageId, DeliveryState)>,
    closed: Vec<String>,
}

/// Broker double that records every call.
///
/// Publishes are settled as accepted straight away unless
/// [`manual_settlement`](Self::manual_settlement) is enabled.
#[derive(Clone, Default)]
pub struct RecordingBroker {
    state: Arc<Mutex<Recorded>>,
}

impl RecordingBroker {
    /// Create a broker that accepts every address.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Refuse links to `address` with [`BrokerError::NotFound`].
    #[must_use]
    pub fn refuse(self, address: impl Into<String>) -> Self {
        self.state().refused.insert(address.into());
        self
    }

    /// Hold publish settlements until [`settle`](Self::settle) is called.
    #[must_use]
    pub fn manual_settlement(self) -> Self {
        self.state().manual_settlement = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self) -> MessageId {
        let mut state = self.state();
        state.next_id += 1;
        MessageId::new(state.next_id)
    }

    /// Hand a message to the subscriber at `address`.
    ///
    /// Returns the message id, or `None` if nothing subscribes there.
    pub fn deliver(&self, address: &str, body: impl Into<Bytes>) -> Option<MessageId> {
        let handler = self.state().handlers.get(address).cloned()?;
        let message_id = self.allocate();
        handler.on_message(message_id, body.into()).then_some(message_id)
    }

    /// Settle a held publish.
    ///
    /// Returns `false` if the message is unknown or already settled.
    pub fn settle(&self, message_id: MessageId, outcome: Settlement) -> bool {
        let Some(callback) = self.state().unsettled.remove(&message_id) else {
            return false;
        };
        match outcome {
            Settlement::Accepted => callback.on_accepted(message_id),
            Settlement::Rejected(reason) => callback.on_rejected(message_id, reason),
        }
        true
    }

    /// Messages published so far.
    #[must_use]
    pub fn published(&self) -> Vec<Published> { self.state().published.clone() }

    /// Credit updates as `(address, delivery_count, credit)`.
    #[must_use]
    pub fn flows(&self) -> Vec<(String, u32, u32)> { self.state().flows.clone() }

    /// Outcomes reported for delivered messages.
    #[must_use]
    pub fn outcomes(&self) -> Vec<(MessageId, DeliveryState)> { self.state().outcomes.clone() }

    /// Addresses whose links were closed, in order.
    #[must_use]
    pub fn closed(&self) -> Vec<String> { self.state().closed.clone() }

    fn check(&self, address: &str) -> Result<(), BrokerError> {
        if self.state().refused.contains(address) {
            return Err(BrokerError::NotFound {
                address: address.to_owned(),
            });
        }
        Ok(())
    }
}

impl Broker for RecordingBroker {
    fn create_sender(&self, address: &str) -> Result<Box<dyn Publisher>, BrokerError> {
        self.check(address)?;
        Ok(Box::new(RecordingEndpoint {
            address: address.to_owned(),
            broker: self.clone(),
        }))
    }

    fn create_receiver(
        &self,
        address: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscriber>, BrokerError> {
        self.check(address)?;
        self.state().handlers.insert(address.to_owned(), handler);
        Ok(Box::new(RecordingEndpoint {
            address: address.to_owned(),
            broker: self.clone(),
        }))
    }
}

struct RecordingEndpoint {
    address: String,
    broker: RecordingBroker,
}

impl RecordingEndpoint {
    fn outcome(&self, message_id: MessageId, state: DeliveryState) -> Result<(), BrokerError> {
        self.broker.state().outcomes.push((message_id, state));
        Ok(())
    }
}

impl Publisher for RecordingEndpoint {
    fn next_message_id(&mut self) -> MessageId { self.broker.allocate() }

    fn publish(
        &mut self,
        _tx_id: TxId,
        message_id: MessageId,
        body: Bytes,
        on_settle: SettleCallback,
    ) -> Result<(), BrokerError> {
        let manual = {
            let mut state = self.broker.state();
            state.published.push(Published {
                address: self.address.clone(),
                message_id,
                body,
            });
            if state.manual_settlement {
                state.unsettled.insert(message_id, on_settle.clone());
            }
            state.manual_settlement
        };
        if !manual {
            on_settle.on_accepted(message_id);
        }
        Ok(())
    }

    fn close(&mut self) { self.broker.state().closed.push(self.address.clone()); }
}

impl Subscriber for RecordingEndpoint {
    fn flow(&mut self, _tx_id: TxId, delivery_count: u32, credit: u32) {
        self.broker
            .state()
            .flows
            .push((self.address.clone(), delivery_count, credit));
    }

    fn accept(&mut self, _tx_id: TxId, message_id: MessageId) -> Result<(), BrokerError> {
        self.outcome(message_id, DeliveryState::Accepted)
    }

    fn reject(
        &mut self,
        _tx_id: TxId,
        message_id: MessageId,
        error: Option<&ErrorCondition>,
    ) -> Result<(), BrokerError> {
        self.outcome(
            message_id,
            DeliveryState::Rejected {
                error: error.cloned(),
            },
        )
    }

    fn release(&mut self, _tx_id: TxId, message_id: MessageId) -> Result<(), BrokerError> {
        self.outcome(message_id, DeliveryState::Released)
    }

    fn modified(
        &mut self,
        _tx_id: TxId,
        message_id: MessageId,
        delivery_failed: bool,
        undeliverable_here: bool,
    ) -> Result<(), BrokerError> {
        self.outcome(
            message_id,
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
            },
        )
    }

    fn close(&mut self) {
        let mut state = self.broker.state();
        state.handlers.remove(&self.address);
        state.closed.push(self.address.clone());
    }
}

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const DUPLEX_CAPACITY: usize = 64 * 1024;

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Client side of an in-memory connection.
pub struct TestPeer {
    framed: Framed<DuplexStream, AmqpCodec>,
}

impl TestPeer {
    /// Wrap the client half of a duplex stream.
    #[must_use]
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, AmqpCodec::default()),
        }
    }

    /// Spawn a connection engine on one half of a duplex stream and return a
    /// peer for the other half together with the engine task.
    #[must_use]
    pub fn spawn(
        broker: Arc<dyn Broker>,
        config: EngineConfig,
    ) -> (Self, JoinHandle<Result<(), EngineError>>) {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let connection = Connection::new(server, broker, Arc::new(config));
        (Self::new(client), tokio::spawn(connection.run()))
    }

    /// Like [`spawn`](Self::spawn) with a custom authenticator.
    #[must_use]
    pub fn spawn_with_authenticator(
        broker: Arc<dyn Broker>,
        authenticator: Arc<dyn Authenticator>,
        config: EngineConfig,
    ) -> (Self, JoinHandle<Result<(), EngineError>>) {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let connection =
            Connection::new(server, broker, Arc::new(config)).with_authenticator(authenticator);
        (Self::new(client), tokio::spawn(connection.run()))
    }

    /// Expect a protocol header as the next inbound unit.
    pub fn expect_header(&mut self) { self.framed.codec_mut().expect_header(); }

    /// Send raw bytes, bypassing the codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    /// Send a protocol header.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed.
    pub async fn send_header(&mut self, header: ProtocolHeader) -> io::Result<()> {
        self.send_unit(Outbound::Header(header)).await
    }

    /// Send a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded or the stream is
    /// closed.
    pub async fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.send_unit(Outbound::Frame(frame)).await
    }

    /// Send a performative on `channel`.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_performative(
        &mut self,
        channel: u16,
        performative: impl Into<Performative>,
    ) -> io::Result<()> {
        self.send(Frame::amqp(channel, performative)).await
    }

    async fn send_unit(&mut self, unit: Outbound) -> io::Result<()> {
        self.framed.send(unit).await.map_err(|e| invalid(e.to_string()))
    }

    /// Receive the next unit, or `None` once the server closed the stream.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or if the bytes cannot be decoded.
    pub async fn recv(&mut self) -> io::Result<Option<Inbound>> {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no unit received")),
            Ok(None) => Ok(None),
            Ok(Some(unit)) => unit.map(Some).map_err(|e| invalid(e.to_string())),
        }
    }

    /// Receive a protocol header.
    ///
    /// # Errors
    ///
    /// Returns an error if anything else arrives.
    pub async fn recv_header(&mut self) -> io::Result<ProtocolHeader> {
        match self.recv().await? {
            Some(Inbound::Header(header)) => Ok(header),
            other => Err(invalid(format!("expected header, got {other:?}"))),
        }
    }

    /// Receive a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if anything else arrives.
    pub async fn recv_frame(&mut self) -> io::Result<Frame> {
        match self.recv().await? {
            Some(Inbound::Frame(frame)) => Ok(frame),
            other => Err(invalid(format!("expected frame, got {other:?}"))),
        }
    }

    /// Receive a SASL frame.
    ///
    /// # Errors
    ///
    /// Returns an error if anything else arrives.
    pub async fn recv_sasl(&mut self) -> io::Result<SaslFrame> {
        match self.recv_frame().await?.body {
            FrameBody::Sasl(sasl) => Ok(sasl),
            other => Err(invalid(format!("expected SASL frame, got {other:?}"))),
        }
    }

    /// Receive a plain performative with its payload.
    ///
    /// # Errors
    ///
    /// Returns an error if anything else arrives.
    pub async fn recv_with_payload(&mut self) -> io::Result<(Performative, Bytes)> {
        match self.recv_frame().await?.body {
            FrameBody::Amqp {
                performative,
                payload,
            } => Ok((performative, payload)),
            other => Err(invalid(format!("expected performative, got {other:?}"))),
        }
    }

    /// Receive a plain performative.
    ///
    /// # Errors
    ///
    /// Returns an error if anything else arrives.
    pub async fn recv_performative(&mut self) -> io::Result<Performative> {
        self.recv_with_payload().await.map(|(performative, _)| performative)
    }

    /// Whether the server has closed the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if a unit arrives instead.
    pub async fn recv_eof(&mut self) -> io::Result<()> {
        match self.recv().await {
            Ok(None) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Ok(Some(unit)) => Err(invalid(format!("expected end of stream, got {unit:?}"))),
            Err(e) => Err(e),
        }
    }

    /// Exchange plain headers and `Open` frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the server answers unexpectedly.
    pub async fn open(&mut self) -> io::Result<Open> {
        self.send_header(ProtocolHeader::AMQP).await?;
        self.recv_header().await?;
        self.send_performative(0, open_frame()).await?;
        match self.recv_performative().await? {
            Performative::Open(open) => Ok(open),
            other => Err(invalid(format!("expected open, got {other:?}"))),
        }
    }

    /// Begin a session on channel 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the server answers unexpectedly.
    pub async fn begin(&mut self) -> io::Result<Begin> {
        self.send_performative(0, begin_frame()).await?;
        match self.recv_performative().await? {
            Performative::Begin(begin) => Ok(begin),
            other => Err(invalid(format!("expected begin, got {other:?}"))),
        }
    }

    /// Attach a link on channel 0 and return the server's reply.
    ///
    /// `role` is the peer's role: a receiver consumes from `address`, a
    /// sender publishes to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the server answers unexpectedly.
    pub async fn attach(&mut self, handle: u32, role: Role, address: &str) -> io::Result<Attach> {
        self.send_performative(0, attach_frame(handle, role, address))
            .await?;
        match self.recv_performative().await? {
            Performative::Attach(attach) => Ok(attach),
            other => Err(invalid(format!("expected attach, got {other:?}"))),
        }
    }

    /// Grant `credit` on the link at `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed.
    pub async fn grant(&mut self, handle: u32, delivery_count: u32, credit: u32) -> io::Result<()> {
        self.send_performative(0, Flow {
            next_incoming_id: Some(0),
            incoming_window: 2048,
            next_outgoing_id: 0,
            outgoing_window: 2048,
            handle: Some(handle),
            delivery_count: Some(delivery_count),
            link_credit: Some(credit),
            drain: false,
            echo: false,
        })
        .await
    }

    /// Receive a transfer and its payload.
    ///
    /// # Errors
    ///
    /// Returns an error if anything else arrives.
    pub async fn recv_transfer(&mut self) -> io::Result<(Transfer, Bytes)> {
        match self.recv_with_payload().await? {
            (Performative::Transfer(transfer), payload) => Ok((transfer, payload)),
            (other, _) => Err(invalid(format!("expected transfer, got {other:?}"))),
        }
    }
}

/// `Open` sent by [`TestPeer::open`].
#[must_use]
pub fn open_frame() -> Open {
    Open {
        container_id: "test-peer".into(),
        hostname: None,
        max_frame_size: 64 * 1024,
        channel_max: 0,
        idle_time_out: None,
    }
}

/// `Begin` sent by [`TestPeer::begin`].
#[must_use]
pub fn begin_frame() -> Begin {
    Begin {
        remote_channel: None,
        next_outgoing_id: 0,
        incoming_window: 2048,
        outgoing_window: 2048,
        handle_max: 255,
    }
}

/// `Attach` sent by [`TestPeer::attach`].
#[must_use]
pub fn attach_frame(handle: u32, role: Role, address: &str) -> Attach {
    let (source, target) = match role {
        Role::Receiver => (
            Some(Source {
                address: Some(address.to_owned()),
            }),
            Some(Target::default()),
        ),
        Role::Sender => (
            Some(Source::default()),
            Some(Target {
                address: Some(address.to_owned()),
            }),
        ),
    };
    Attach {
        name: format!("link-{handle}"),
        handle,
        role,
        source,
        target,
        initial_delivery_count: (role == Role::Sender).then_some(0),
    }
}
