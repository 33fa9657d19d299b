//! Session engine.
//!
//! A [`Session`] owns the links attached on one channel, assigns delivery
//! ids to outbound transfers and settles them as the peer's dispositions
//! arrive. It never touches the socket: every handler appends the frames it
//! wants sent to an outbox supplied by the connection, so the session can be
//! driven and inspected without any I/O.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    broker::{Broker, BrokerError, EventSender, MessageHandler, MessageId, SettleCallback, Settlement},
    codec::{CodecError, Frame, FramingError, transfer_capacity},
    config::{DispositionMode, EngineConfig},
    error::EngineError,
    link::{Link, LinkKey, PublishLink, SubscribeLink},
    performative::{
        Attach,
        Begin,
        DeliveryState,
        Detach,
        Disposition,
        End,
        Flow,
        Performative,
        Role,
        Transfer,
    },
};


/// An outbound transfer the peer has not settled yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Session-scoped id carried by the transfer.
    pub delivery_id: u32,
    /// Link the message was sent on.
    pub link: LinkKey,
    /// Broker identifier of the message.
    pub message_id: MessageId,
}

/// Server side of a session.
#[derive(Debug)]
pub struct Session {
    channel: u16,
    links: HashMap<u32, Link>,
    deliveries: VecDeque<Delivery>,
    next_delivery_id: Option<u32>,
    next_outgoing_id: u32,
    next_incoming_id: u32,
    remote_incoming_window: u32,
    window: u32,
    handle_max: u32,
    publish_credit: u32,
    disposition_mode: DispositionMode,
    max_frame_size: u32,
}

impl Session {
    /// Start a session in answer to the peer's `Begin` on `channel`.
    ///
    /// Returns the session and the `Begin` to send back. Outbound frames of
    /// the session use the same channel number the peer chose.
    #[must_use]
    pub fn begin(
        channel: u16,
        remote: &Begin,
        config: &EngineConfig,
        max_frame_size: u32,
    ) -> (Self, Begin) {
        let session = Self {
            channel,
            links: HashMap::new(),
            deliveries: VecDeque::new(),
            next_delivery_id: Some(1),
            next_outgoing_id: 0,
            next_incoming_id: remote.next_outgoing_id,
            remote_incoming_window: remote.incoming_window,
            window: config.session_window,
            handle_max: config.handle_max,
            publish_credit: config.publish_credit,
            disposition_mode: config.disposition_mode,
            max_frame_size,
        };
        let reply = Begin {
            remote_channel: Some(channel),
            next_outgoing_id: session.next_outgoing_id,
            incoming_window: session.window,
            outgoing_window: session.window,
            handle_max: session.handle_max,
        };
        debug!(channel, handle_max = session.handle_max, "session begun");
        (session, reply)
    }

    /// Channel the session is bound to.
    #[must_use]
    pub fn channel(&self) -> u16 { self.channel }

    /// Number of attached links.
    #[must_use]
    pub fn link_count(&self) -> usize { self.links.len() }

    /// Link attached at `handle`.
    #[must_use]
    pub fn link(&self, handle: u32) -> Option<&Link> { self.links.get(&handle) }

    /// Outbound deliveries awaiting the peer's disposition, oldest first.
    pub fn deliveries(&self) -> impl Iterator<Item = &Delivery> { self.deliveries.iter() }

    /// Transfer id the session expects next from the peer.
    #[must_use]
    pub fn next_incoming_id(&self) -> u32 { self.next_incoming_id }

    /// Transfer window the peer last advertised.
    #[must_use]
    pub fn remote_incoming_window(&self) -> u32 { self.remote_incoming_window }

    fn frame(&self, performative: impl Into<Performative>) -> Frame {
        Frame::amqp(self.channel, performative)
    }

    fn link_flow(&self, handle: u32, delivery_count: u32, link_credit: u32) -> Frame {
        self.link_flow_drained(handle, delivery_count, link_credit, false)
    }

    fn link_flow_drained(&self, handle: u32, delivery_count: u32, link_credit: u32, drain: bool) -> Frame {
        self.frame(Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: self.window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.window,
            handle: Some(handle),
            delivery_count: Some(delivery_count),
            link_credit: Some(link_credit),
            drain,
            echo: false,
        })
    }

    /// Attach a link.
    ///
    /// The reply mirrors the peer's role under the same name and handle. A
    /// peer sender gets a [`PublishLink`] plus an initial credit grant; a
    /// peer receiver gets a [`SubscribeLink`]. When the broker refuses the
    /// address the reply `Attach` is followed by a closing `Detach` carrying
    /// the broker's error, and no link is installed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HandleInUse`] if `handle` is still attached, or
    /// [`EngineError::ProtocolSequence`] if it exceeds the advertised
    /// `handle_max`.
    pub fn on_attach(
        &mut self,
        attach: Attach,
        broker: &dyn Broker,
        events: &EventSender,
        out: &mut Vec<Frame>,
    ) -> Result<(), EngineError> {
        let handle = attach.handle;
        if handle > self.handle_max {
            return Err(EngineError::sequence("attach", "the handle exceeds handle-max"));
        }
        if self.links.contains_key(&handle) {
            return Err(EngineError::HandleInUse { handle });
        }
        let key = LinkKey::attach(handle);
        let mut reply = Attach {
            role: attach.role.mirror(),
            initial_delivery_count: (attach.role == Role::Receiver).then_some(0),
            ..attach.clone()
        };
        match self.create_link(key, &attach, broker, events) {
            Ok(mut link) => {
                info!(
                    channel = self.channel,
                    handle,
                    name = %attach.name,
                    address = link.address(),
                    role = ?link.role(),
                    "link attached"
                );
                out.push(self.frame(reply));
                let grant = match &mut link {
                    Link::Publish(publish) => Some(publish.replenish()),
                    Link::Subscribe(_) => None,
                };
                self.links.insert(handle, link);
                if let Some((delivery_count, credit)) = grant {
                    out.push(self.link_flow(handle, delivery_count, credit));
                }
            }
            Err(error) => {
                warn!(channel = self.channel, handle, name = %attach.name, %error, "link refused");
                // A missing terminus tells the peer the link was not created.
                match attach.role {
                    Role::Sender => reply.target = None,
                    Role::Receiver => reply.source = None,
                }
                out.push(self.frame(reply));
                out.push(self.frame(Detach {
                    handle,
                    closed: true,
                    error: Some(error.condition()),
                }));
            }
        }
        Ok(())
    }

    fn create_link(
        &self,
        key: LinkKey,
        attach: &Attach,
        broker: &dyn Broker,
        events: &EventSender,
    ) -> Result<Link, BrokerError> {
        let address = match attach.role {
            Role::Sender => attach.target.as_ref().and_then(|t| t.address.clone()),
            Role::Receiver => attach.source.as_ref().and_then(|s| s.address.clone()),
        }
        .ok_or_else(|| BrokerError::NotFound {
            address: String::new(),
        })?;
        Ok(match attach.role {
            Role::Sender => {
                let publisher = broker.create_sender(&address)?;
                Link::Publish(PublishLink::new(
                    key,
                    attach.name.clone(),
                    address,
                    publisher,
                    SettleCallback::new(key, events.clone()),
                    self.publish_credit,
                ))
            }
            Role::Receiver => {
                let subscriber =
                    broker.create_receiver(&address, MessageHandler::new(key, events.clone()))?;
                Link::Subscribe(SubscribeLink::new(
                    key,
                    attach.name.clone(),
                    address,
                    subscriber,
                ))
            }
        })
    }

    /// Handle a transfer frame from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownLinkHandle`] if nothing is attached at
    /// the frame's handle, or [`EngineError::ProtocolSequence`] if the link
    /// at that handle sends rather than receives.
    pub fn on_transfer(
        &mut self,
        transfer: &Transfer,
        payload: &[u8],
        out: &mut Vec<Frame>,
    ) -> Result<(), EngineError> {
        let handle = transfer.handle;
        let link = match self.links.get_mut(&handle) {
            Some(Link::Publish(link)) => link,
            Some(Link::Subscribe(_)) => {
                return Err(EngineError::sequence("transfer", "the link sends to the peer"));
            }
            None => return Err(EngineError::UnknownLinkHandle { handle }),
        };
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        let rejected = link.on_transfer(transfer, payload)?;
        let refill = link.needs_credit().then(|| link.replenish());
        if let Some(disposition) = rejected {
            out.push(self.frame(disposition));
        }
        if let Some((delivery_count, credit)) = refill {
            debug!(channel = self.channel, handle, credit, "replenishing publish credit");
            out.push(self.link_flow(handle, delivery_count, credit));
        }
        Ok(())
    }

    /// Register an outbound delivery and return its id.
    ///
    /// Ids start at 1 and increase by one per call. They are never reused:
    /// once `u32::MAX` has been handed out the session cannot send again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeliveryIdsExhausted`] when no id is left.
    pub fn add_delivery(&mut self, link: LinkKey, message_id: MessageId) -> Result<u32, EngineError> {
        let delivery_id = self.next_delivery_id.ok_or(EngineError::DeliveryIdsExhausted)?;
        self.next_delivery_id = delivery_id.checked_add(1);
        self.deliveries.push_back(Delivery {
            delivery_id,
            link,
            message_id,
        });
        Ok(delivery_id)
    }

    /// Handle a disposition frame from the peer.
    ///
    /// In [`DispositionMode::FifoHead`] the oldest outstanding delivery is
    /// settled whatever range the frame declares; in
    /// [`DispositionMode::Range`] every outstanding delivery inside the range
    /// is. An empty queue makes this a no-op. Returns the number of
    /// deliveries settled.
    pub fn on_disposition(&mut self, disposition: &Disposition, out: &mut Vec<Frame>) -> usize {
        if disposition.role == Role::Sender {
            debug!(channel = self.channel, "ignoring disposition from a sending peer");
            return 0;
        }
        let settled: Vec<Delivery> = match self.disposition_mode {
            DispositionMode::FifoHead => self.deliveries.pop_front().into_iter().collect(),
            DispositionMode::Range => {
                let (first, last) = disposition.range();
                let (inside, outside): (Vec<_>, Vec<_>) = self
                    .deliveries
                    .drain(..)
                    .partition(|d| (first..=last).contains(&d.delivery_id));
                self.deliveries = outside.into();
                inside
            }
        };
        let Some(head) = settled.first() else {
            return 0;
        };
        let state = disposition
            .state
            .clone()
            .unwrap_or(DeliveryState::Released);
        if !disposition.settled {
            let (first, last) = match self.disposition_mode {
                DispositionMode::FifoHead => (head.delivery_id, head.delivery_id),
                DispositionMode::Range => disposition.range(),
            };
            out.push(self.frame(Disposition {
                role: Role::Sender,
                first,
                last: (last != first).then_some(last),
                settled: true,
                state: Some(state.clone()),
            }));
        }
        for delivery in &settled {
            self.apply_outcome(delivery, &state);
        }
        settled.len()
    }

    fn apply_outcome(&mut self, delivery: &Delivery, state: &DeliveryState) {
        let Some(Link::Subscribe(link)) = self
            .links
            .get_mut(&delivery.link.handle)
            .filter(|l| l.key() == delivery.link)
        else {
            debug!(
                channel = self.channel,
                delivery_id = delivery.delivery_id,
                "outcome for a detached link"
            );
            return;
        };
        match link.apply(delivery.message_id, state) {
            Ok(()) => {
                crate::metrics::inc_settled(state.label());
                debug!(
                    channel = self.channel,
                    handle = delivery.link.handle,
                    delivery_id = delivery.delivery_id,
                    outcome = state.label(),
                    "delivery settled"
                );
            }
            Err(error) => warn!(
                channel = self.channel,
                delivery_id = delivery.delivery_id,
                %error,
                "broker refused outcome"
            ),
        }
    }

    /// Handle a flow frame from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownLinkHandle`] if the frame names a handle
    /// with no attached link, or a codec error if a released transfer cannot
    /// fit in a frame.
    pub fn on_flow(&mut self, flow: &Flow, out: &mut Vec<Frame>) -> Result<(), EngineError> {
        self.remote_incoming_window = flow.incoming_window;
        let Some(handle) = flow.handle else {
            if flow.echo {
                out.push(self.frame(Flow {
                    next_incoming_id: Some(self.next_incoming_id),
                    incoming_window: self.window,
                    next_outgoing_id: self.next_outgoing_id,
                    outgoing_window: self.window,
                    ..Flow::default()
                }));
            }
            return Ok(());
        };
        let state = match self.links.get_mut(&handle) {
            Some(Link::Subscribe(link)) => {
                let credit = flow.link_credit.unwrap_or_else(|| link.credit());
                link.on_flow(flow.delivery_count, credit, flow.drain);
                None
            }
            Some(Link::Publish(link)) => Some((link.delivery_count(), link.credit())),
            None => return Err(EngineError::UnknownLinkHandle { handle }),
        };
        if let Some((delivery_count, credit)) = state {
            if flow.echo {
                out.push(self.link_flow(handle, delivery_count, credit));
            }
            return Ok(());
        }
        self.pump(handle, out)?;
        let Some(Link::Subscribe(link)) = self.links.get_mut(&handle) else {
            return Ok(());
        };
        let drained = link.complete_drain();
        let (delivery_count, credit) = (link.delivery_count(), link.credit());
        if drained || flow.echo {
            out.push(self.link_flow_drained(handle, delivery_count, credit, drained));
        }
        Ok(())
    }

    /// Handle a detach frame from the peer.
    ///
    /// Outstanding deliveries of the link are forgotten; the broker takes
    /// back anything it had handed over.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownLinkHandle`] if nothing is attached at
    /// the frame's handle.
    pub fn on_detach(&mut self, detach: &Detach, out: &mut Vec<Frame>) -> Result<(), EngineError> {
        let handle = detach.handle;
        let mut link = self
            .links
            .remove(&handle)
            .ok_or(EngineError::UnknownLinkHandle { handle })?;
        let key = link.key();
        self.deliveries.retain(|d| d.link != key);
        link.close();
        if let Some(error) = &detach.error {
            info!(channel = self.channel, handle, condition = %error.condition, "peer detached link with error");
        } else {
            info!(channel = self.channel, handle, "link detached");
        }
        out.push(self.frame(Detach {
            handle,
            closed: detach.closed,
            error: None,
        }));
        Ok(())
    }

    /// Handle an end frame from the peer: detach every link and reply.
    pub fn on_end(&mut self, end: &End, out: &mut Vec<Frame>) {
        if let Some(error) = &end.error {
            info!(channel = self.channel, condition = %error.condition, "peer ended session with error");
        }
        self.end();
        out.push(self.frame(End::default()));
    }

    /// Detach every link without notifying the peer.
    pub fn end(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.close();
        }
        self.deliveries.clear();
    }

    /// Queue a broker message on its subscribe link and send what credit
    /// allows.
    ///
    /// Messages for a link that has since been detached are dropped; the
    /// broker reclaimed them when the subscriber closed.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the transfer cannot fit in a frame.
    pub fn on_broker_message(
        &mut self,
        link: LinkKey,
        message_id: MessageId,
        body: Bytes,
        out: &mut Vec<Frame>,
    ) -> Result<(), EngineError> {
        match self.links.get_mut(&link.handle) {
            Some(Link::Subscribe(subscribe)) if subscribe.key() == link => {
                subscribe.enqueue(message_id, body);
            }
            _ => {
                debug!(channel = self.channel, %link, %message_id, "message for a detached link");
                return Ok(());
            }
        }
        self.pump(link.handle, out)
    }

    /// Send queued messages on a subscribe link while it has credit.
    ///
    /// # Errors
    ///
    /// Returns a codec error if a transfer cannot fit in a frame.
    pub fn pump(&mut self, handle: u32, out: &mut Vec<Frame>) -> Result<(), EngineError> {
        loop {
            let Some(Link::Subscribe(link)) = self.links.get_mut(&handle) else {
                return Ok(());
            };
            let key = link.key();
            let Some((message_id, body)) = link.next_sendable() else {
                return Ok(());
            };
            let delivery_id = self.add_delivery(key, message_id)?;
            self.send_transfer(handle, delivery_id, body, out)?;
        }
    }

    /// Emit one delivery, split across as many frames as the negotiated
    /// frame size requires.
    fn send_transfer(
        &mut self,
        handle: u32,
        delivery_id: u32,
        mut body: Bytes,
        out: &mut Vec<Frame>,
    ) -> Result<(), EngineError> {
        let mut transfer = Transfer {
            handle,
            delivery_id: Some(delivery_id),
            delivery_tag: Some(delivery_id.to_be_bytes().to_vec()),
            settled: false,
            more: true,
        };
        let capacity = transfer_capacity(self.max_frame_size, &transfer)?;
        if capacity == 0 {
            return Err(EngineError::from(CodecError::from(FramingError::OversizedFrame {
                size: body.len(),
                max: self.max_frame_size as usize,
            })));
        }
        debug!(channel = self.channel, handle, delivery_id, size = body.len(), "sending transfer");
        while body.len() > capacity {
            let chunk = body.split_to(capacity);
            out.push(Frame::transfer(self.channel, transfer.clone(), chunk));
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        }
        transfer.more = false;
        out.push(Frame::transfer(self.channel, transfer, body));
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        Ok(())
    }

    /// Report the broker's verdict on a published message to the peer.
    pub fn on_settled(&mut self, link: LinkKey, message_id: MessageId, outcome: Settlement, out: &mut Vec<Frame>) {
        let disposition = match self.links.get_mut(&link.handle) {
            Some(Link::Publish(publish)) if publish.key() == link => publish.settle(message_id, outcome),
            _ => {
                debug!(channel = self.channel, %link, %message_id, "settlement for a detached link");
                None
            }
        };
        if let Some(disposition) = disposition {
            out.push(self.frame(disposition));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) { self.end(); }
}
