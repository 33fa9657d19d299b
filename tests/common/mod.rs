//! Shared utilities for integration tests.
//!
//! Provides a helper to run an [`AmqpServer`] on a free local port and a
//! minimal TCP client speaking the protocol through [`AmqpCodec`].

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
    time::Duration,
};

use amqpframe::{
    EngineConfig,
    broker::Broker,
    codec::{AmqpCodec, Frame, FrameBody, Inbound, Outbound},
    header::ProtocolHeader,
    performative::{Performative, Role, SaslFrame, Transfer},
    sasl::Authenticator,
    server::{AmqpServer, ServerError},
    test_helpers::{attach_frame, begin_frame, open_frame},
};
use amqpframe_testing::TestResult;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle, time::timeout};
use tokio_util::codec::Framed;

/// Create a TCP listener bound to a free local port.
#[expect(
    clippy::expect_used,
    reason = "binding to an ephemeral localhost port must abort the test immediately"
)]
pub fn unused_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("failed to bind port")
}

/// A server running in the background until [`RunningServer::stop`].
pub struct RunningServer {
    pub addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    /// Start a single-worker server on a free port.
    pub async fn start(
        broker: Arc<dyn Broker>,
        authenticator: Option<Arc<dyn Authenticator>>,
        config: EngineConfig,
    ) -> TestResult<Self> {
        let mut server = AmqpServer::new(broker).workers(1).with_config(config);
        if let Some(authenticator) = authenticator {
            server = server.with_authenticator(authenticator);
        }
        let server = server.bind_existing_listener(unused_listener())?;
        let addr = server.local_addr().ok_or("server has no address")?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.ready_signal(ready_tx).run_with_shutdown(async move {
            let _ = stop_rx.await;
        }));
        ready_rx.await?;
        Ok(Self { addr, stop, handle })
    }

    /// Signal shutdown and wait for every connection task to finish.
    pub async fn stop(self) -> TestResult {
        let _ = self.stop.send(());
        timeout(Duration::from_secs(2), self.handle).await???;
        Ok(())
    }
}

/// Protocol client over TCP.
pub struct Client {
    framed: Framed<TcpStream, AmqpCodec>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> TestResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, AmqpCodec::default()),
        })
    }

    pub fn expect_header(&mut self) { self.framed.codec_mut().expect_header(); }

    pub async fn send(&mut self, unit: impl Into<Outbound>) -> TestResult {
        self.framed.send(unit.into()).await?;
        Ok(())
    }

    pub async fn send_header(&mut self, header: ProtocolHeader) -> TestResult {
        self.send(Outbound::Header(header)).await
    }

    pub async fn send_performative(&mut self, performative: impl Into<Performative>) -> TestResult {
        self.send(Frame::amqp(0, performative)).await
    }

    pub async fn send_transfer(&mut self, transfer: Transfer, payload: &'static [u8]) -> TestResult {
        self.send(Frame::transfer(0, transfer, Bytes::from_static(payload)))
            .await
    }

    /// Next unit, or `None` once the server closed the socket.
    pub async fn recv(&mut self) -> TestResult<Option<Inbound>> {
        Ok(timeout(Duration::from_secs(2), self.framed.next())
            .await?
            .transpose()?)
    }

    pub async fn recv_header(&mut self) -> TestResult<ProtocolHeader> {
        match self.recv().await? {
            Some(Inbound::Header(header)) => Ok(header),
            other => Err(format!("expected header, got {other:?}").into()),
        }
    }

    pub async fn recv_sasl(&mut self) -> TestResult<SaslFrame> {
        match self.recv().await? {
            Some(Inbound::Frame(Frame {
                body: FrameBody::Sasl(sasl),
                ..
            })) => Ok(sasl),
            other => Err(format!("expected SASL frame, got {other:?}").into()),
        }
    }

    pub async fn recv_with_payload(&mut self) -> TestResult<(Performative, Bytes)> {
        match self.recv().await? {
            Some(Inbound::Frame(Frame {
                body:
                    FrameBody::Amqp {
                        performative,
                        payload,
                    },
                ..
            })) => Ok((performative, payload)),
            other => Err(format!("expected performative, got {other:?}").into()),
        }
    }

    pub async fn recv_performative(&mut self) -> TestResult<Performative> {
        Ok(self.recv_with_payload().await?.0)
    }

    /// Exchange plain headers and `Open`, then begin a session.
    pub async fn handshake(&mut self) -> TestResult {
        self.send_header(ProtocolHeader::AMQP).await?;
        self.recv_header().await?;
        self.open_and_begin().await
    }

    /// Send `Open` and `Begin` and consume both replies.
    pub async fn open_and_begin(&mut self) -> TestResult {
        self.send_performative(open_frame()).await?;
        match self.recv_performative().await? {
            Performative::Open(_) => {}
            other => return Err(format!("expected open, got {other:?}").into()),
        }
        self.send_performative(begin_frame()).await?;
        match self.recv_performative().await? {
            Performative::Begin(_) => Ok(()),
            other => Err(format!("expected begin, got {other:?}").into()),
        }
    }

    /// Attach a link and return the server's reply.
    pub async fn attach(&mut self, handle: u32, role: Role, address: &str) -> TestResult<Performative> {
        self.send_performative(attach_frame(handle, role, address))
            .await?;
        self.recv_performative().await
    }
}
