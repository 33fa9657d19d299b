//! Broker-to-peer link.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

use super::LinkKey;
use crate::{
    broker::{BrokerError, MessageId, Subscriber},
    performative::{DeliveryState, ErrorCondition},
};

/// Server endpoint of a link on which the peer consumes.
///
/// Messages handed over by the broker wait in a backlog until the peer has
/// granted credit for them.
pub struct SubscribeLink {
    key: LinkKey,
    name: String,
    address: String,
    subscriber: Box<dyn Subscriber>,
    backlog: VecDeque<(MessageId, Bytes)>,
    delivery_count: u32,
    link_credit: u32,
    drain: bool,
}

impl SubscribeLink {
    /// Wrap a broker subscriber. The link starts with no credit.
    #[must_use]
    pub fn new(
        key: LinkKey,
        name: impl Into<String>,
        address: impl Into<String>,
        subscriber: Box<dyn Subscriber>,
    ) -> Self {
        Self {
            key,
            name: name.into(),
            address: address.into(),
            subscriber,
            backlog: VecDeque::new(),
            delivery_count: 0,
            link_credit: 0,
            drain: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> LinkKey { self.key }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    #[must_use]
    pub fn address(&self) -> &str { &self.address }

    #[must_use]
    pub fn delivery_count(&self) -> u32 { self.delivery_count }

    #[must_use]
    pub fn credit(&self) -> u32 { self.link_credit }

    /// Messages held back for lack of credit.
    #[must_use]
    pub fn backlog(&self) -> usize { self.backlog.len() }

    /// Queue a message handed over by the broker.
    pub fn enqueue(&mut self, message_id: MessageId, body: Bytes) {
        self.backlog.push_back((message_id, body));
    }

    /// Take the next message the peer has credit for.
    ///
    /// Consumes one unit of credit and advances the delivery count.
    pub fn next_sendable(&mut self) -> Option<(MessageId, Bytes)> {
        if self.link_credit == 0 {
            return None;
        }
        let next = self.backlog.pop_front()?;
        self.link_credit -= 1;
        self.delivery_count = self.delivery_count.wrapping_add(1);
        Some(next)
    }

    /// Apply the peer's link flow state.
    ///
    /// The usable credit is the peer's grant measured from its view of the
    /// delivery count: `remote_delivery_count + link_credit - delivery_count`.
    /// A missing `delivery_count` is taken to agree with the local one.
    pub fn on_flow(&mut self, delivery_count: Option<u32>, link_credit: u32, drain: bool) {
        let available = delivery_count
            .unwrap_or(self.delivery_count)
            .wrapping_add(link_credit)
            .wrapping_sub(self.delivery_count);
        // Serial arithmetic: anything past half the range is negative.
        self.link_credit = if available > u32::MAX / 2 {
            0
        } else {
            available.min(link_credit)
        };
        self.drain = drain;
        debug!(
            link = %self.key,
            delivery_count = self.delivery_count,
            credit = self.link_credit,
            drain,
            "link credit updated"
        );
        self.subscriber
            .flow(None, self.delivery_count, self.link_credit);
    }

    /// Finish a drain request once the backlog can no longer use the credit.
    ///
    /// Advances the delivery count by the unused credit and returns `true`
    /// if the peer must be sent a `Flow` reporting the drained state.
    pub fn complete_drain(&mut self) -> bool {
        if !self.drain || (!self.backlog.is_empty() && self.link_credit > 0) {
            return false;
        }
        self.drain = false;
        self.delivery_count = self.delivery_count.wrapping_add(self.link_credit);
        self.link_credit = 0;
        self.subscriber.flow(None, self.delivery_count, 0);
        true
    }

    /// Route the peer's outcome for a delivered message to the broker.
    ///
    /// # Errors
    ///
    /// Propagates the broker's refusal, for example for an unknown message.
    pub fn apply(&mut self, message_id: MessageId, state: &DeliveryState) -> Result<(), BrokerError> {
        match state {
            DeliveryState::Accepted => self.accept(message_id),
            DeliveryState::Rejected { error } => self.reject(message_id, error.as_ref()),
            DeliveryState::Released => self.release(message_id),
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
            } => self.modified(message_id, *delivery_failed, *undeliverable_here),
        }
    }

    /// # Errors
    ///
    /// Propagates the broker's refusal.
    pub fn accept(&mut self, message_id: MessageId) -> Result<(), BrokerError> {
        self.subscriber.accept(None, message_id)
    }

    /// # Errors
    ///
    /// Propagates the broker's refusal.
    pub fn reject(
        &mut self,
        message_id: MessageId,
        error: Option<&ErrorCondition>,
    ) -> Result<(), BrokerError> {
        self.subscriber.reject(None, message_id, error)
    }

    /// # Errors
    ///
    /// Propagates the broker's refusal.
    pub fn release(&mut self, message_id: MessageId) -> Result<(), BrokerError> {
        self.subscriber.release(None, message_id)
    }

    /// # Errors
    ///
    /// Propagates the broker's refusal.
    pub fn modified(
        &mut self,
        message_id: MessageId,
        delivery_failed: bool,
        undeliverable_here: bool,
    ) -> Result<(), BrokerError> {
        self.subscriber
            .modified(None, message_id, delivery_failed, undeliverable_here)
    }

    /// Return undelivered messages to the broker and release the subscriber.
    pub fn close(&mut self) {
        for (message_id, _) in self.backlog.drain(..) {
            if let Err(error) = self.subscriber.release(None, message_id) {
                debug!(link = %self.key, %message_id, %error, "could not release backlog message");
            }
        }
        self.link_credit = 0;
        self.subscriber.close();
    }
}
