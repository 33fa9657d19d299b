//! Routing of inbound units and broker events.

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{Connection, ConnectionState};
use crate::{
    broker::BrokerEvent,
    codec::{Frame, FrameBody, Inbound, Outbound},
    error::EngineError,
    header::{ProtocolHeader, ProtocolId},
    metrics::{self, Direction},
    performative::{Begin, Close, Open, Performative, SaslCode, SaslFrame, SaslMechanisms, SaslOutcome},
    sasl::SaslVerdict,
    session::Session,
};

fn unit_name(unit: &Inbound) -> &'static str {
    match unit {
        Inbound::Header(_) => "protocol header",
        Inbound::Frame(frame) => match &frame.body {
            FrameBody::Empty => "empty",
            FrameBody::Amqp { performative, .. } => performative.name(),
            FrameBody::Sasl(_) => "sasl",
        },
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(super) async fn on_unit(&mut self, unit: Inbound) -> Result<(), EngineError> {
        metrics::inc_frames(Direction::Inbound);
        match (self.state, unit) {
            (ConnectionState::New | ConnectionState::AwaitingAmqpHeader, Inbound::Header(header)) => {
                self.on_header(header).await
            }
            (ConnectionState::Sasl, Inbound::Frame(frame)) => self.on_sasl(frame),
            (ConnectionState::AwaitingOpen, Inbound::Frame(frame)) => self.on_handshake(frame),
            (ConnectionState::Open, Inbound::Frame(frame)) => self.on_frame(frame),
            (state, unit) => Err(EngineError::sequence(unit_name(&unit), state.name())),
        }
    }

    async fn on_header(&mut self, header: ProtocolHeader) -> Result<(), EngineError> {
        let authenticated = self.state == ConnectionState::AwaitingAmqpHeader;
        let next = match header.id() {
            ProtocolId::Sasl if authenticated => {
                return Err(EngineError::sequence("sasl header", self.state.name()));
            }
            ProtocolId::Sasl => ConnectionState::Sasl,
            ProtocolId::Amqp if self.config.require_sasl && !authenticated => {
                return Err(EngineError::sequence("amqp header", "authentication is required"));
            }
            ProtocolId::Amqp => ConnectionState::AwaitingOpen,
        };
        debug!(connection_id = %self.id, protocol = ?header.id(), "protocol header accepted");
        self.framed.feed(Outbound::Header(header)).await?;
        if next == ConnectionState::Sasl {
            self.send(Frame::sasl(SaslFrame::Mechanisms(SaslMechanisms {
                mechanisms: self.authenticator.mechanisms(),
            })));
        }
        self.state = next;
        Ok(())
    }

    fn on_sasl(&mut self, frame: Frame) -> Result<(), EngineError> {
        let FrameBody::Sasl(SaslFrame::Init(init)) = frame.body else {
            return Err(EngineError::sequence("non-init", ConnectionState::Sasl.name()));
        };
        let verdict = self
            .authenticator
            .authenticate(&init.mechanism, init.initial_response.as_deref());
        let code = match verdict {
            SaslVerdict::Accept => SaslCode::Ok,
            SaslVerdict::Reject => SaslCode::Auth,
        };
        self.send(Frame::sasl(SaslFrame::Outcome(SaslOutcome {
            code,
            additional_data: None,
        })));
        if verdict == SaslVerdict::Reject {
            warn!(connection_id = %self.id, mechanism = %init.mechanism, "authentication refused");
            self.state = ConnectionState::Closed;
            return Err(EngineError::Authentication {
                mechanism: init.mechanism,
            });
        }
        info!(connection_id = %self.id, mechanism = %init.mechanism, "peer authenticated");
        self.framed.codec_mut().expect_header();
        self.state = ConnectionState::AwaitingAmqpHeader;
        Ok(())
    }

    fn on_handshake(&mut self, frame: Frame) -> Result<(), EngineError> {
        let awaiting = ConnectionState::AwaitingOpen.name();
        let open = match frame.body {
            FrameBody::Amqp {
                performative: Performative::Open(open),
                ..
            } => open,
            FrameBody::Amqp { performative, .. } => {
                return Err(EngineError::sequence(performative.name(), awaiting));
            }
            FrameBody::Empty => return Ok(()),
            FrameBody::Sasl(_) => return Err(EngineError::sequence("sasl", awaiting)),
        };
        let max_frame_size = self.config.max_frame_size.min(open.max_frame_size);
        self.framed.codec_mut().set_max_outbound(max_frame_size);
        info!(
            connection_id = %self.id,
            container_id = %open.container_id,
            max_frame_size,
            "connection open"
        );
        self.send(Frame::amqp(0, Open {
            container_id: self.config.container_id.clone(),
            hostname: None,
            max_frame_size,
            channel_max: 0,
            idle_time_out: None,
        }));
        self.state = ConnectionState::Open;
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), EngineError> {
        let channel = frame.channel;
        let (performative, payload) = match frame.body {
            FrameBody::Empty => return Ok(()),
            FrameBody::Sasl(_) => return Err(EngineError::sequence("sasl", ConnectionState::Open.name())),
            FrameBody::Amqp {
                performative,
                payload,
            } => (performative, payload),
        };
        debug!(connection_id = %self.id, channel, frame = performative.name(), "received frame");
        match performative {
            Performative::Open(_) => Err(EngineError::sequence("open", ConnectionState::Open.name())),
            Performative::Begin(begin) => self.on_begin(channel, &begin),
            Performative::Close(close) => {
                self.on_close(&close);
                Ok(())
            }
            other => {
                let name = other.name();
                let Some(session) = self.session.as_mut().filter(|s| s.channel() == channel) else {
                    return Err(EngineError::sequence(name, "no session is active on the channel"));
                };
                let out = &mut self.outbox;
                match other {
                    Performative::Attach(attach) => {
                        session.on_attach(attach, self.broker.as_ref(), &self.events, out)
                    }
                    Performative::Transfer(transfer) => session.on_transfer(&transfer, &payload, out),
                    Performative::Flow(flow) => session.on_flow(&flow, out),
                    Performative::Disposition(disposition) => {
                        session.on_disposition(&disposition, out);
                        Ok(())
                    }
                    Performative::Detach(detach) => session.on_detach(&detach, out),
                    Performative::End(end) => {
                        session.on_end(&end, out);
                        self.session = None;
                        Ok(())
                    }
                    Performative::Open(_) | Performative::Begin(_) | Performative::Close(_) => {
                        Err(EngineError::sequence(name, ConnectionState::Open.name()))
                    }
                }
            }
        }
    }

    fn on_begin(&mut self, channel: u16, begin: &Begin) -> Result<(), EngineError> {
        if self.session.is_some() {
            return Err(EngineError::sequence("begin", "a session is already active"));
        }
        let (session, reply) =
            Session::begin(channel, begin, &self.config, self.framed.codec().max_outbound());
        info!(connection_id = %self.id, channel, "session started");
        self.session = Some(session);
        self.send(Frame::amqp(channel, reply));
        Ok(())
    }

    fn on_close(&mut self, close: &Close) {
        match &close.error {
            Some(error) => {
                info!(connection_id = %self.id, condition = %error.condition, "peer closed connection with error");
            }
            None => info!(connection_id = %self.id, "peer closed connection"),
        }
        self.send(Frame::amqp(0, Close::default()));
        self.state = ConnectionState::Closed;
    }

    pub(super) fn on_broker_event(&mut self, event: BrokerEvent) -> Result<(), EngineError> {
        let Some(session) = self.session.as_mut() else {
            debug!(connection_id = %self.id, ?event, "broker event without a session");
            return Ok(());
        };
        match event {
            BrokerEvent::Message {
                link,
                message_id,
                body,
            } => session.on_broker_message(link, message_id, body, &mut self.outbox),
            BrokerEvent::Settled {
                link,
                message_id,
                outcome,
            } => {
                session.on_settled(link, message_id, outcome, &mut self.outbox);
                Ok(())
            }
        }
    }
}
