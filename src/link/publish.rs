//! Peer-to-broker link.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::LinkKey;
use crate::{
    broker::{MessageId, Publisher, SettleCallback, Settlement},
    error::EngineError,
    performative::{DeliveryState, Disposition, ErrorCondition, Role, Transfer, condition},
};

/// Delivery whose frames are still arriving.
#[derive(Debug)]
struct Partial {
    delivery_id: Option<u32>,
    settled: bool,
    body: BytesMut,
}

/// Server endpoint of a link on which the peer publishes.
///
/// Completed deliveries are published into the broker. Unsettled ones are
/// remembered until the broker's verdict arrives, which is then reported to
/// the peer as a settled `Disposition`.
pub struct PublishLink {
    key: LinkKey,
    name: String,
    address: String,
    publisher: Box<dyn Publisher>,
    on_settle: SettleCallback,
    pending: HashMap<MessageId, u32>,
    partial: Option<Partial>,
    delivery_count: u32,
    credit: u32,
    credit_window: u32,
}

impl PublishLink {
    /// Wrap a broker publisher.
    ///
    /// `credit_window` is granted to the peer when the link attaches and
    /// topped up once half of it has been used.
    #[must_use]
    pub fn new(
        key: LinkKey,
        name: impl Into<String>,
        address: impl Into<String>,
        publisher: Box<dyn Publisher>,
        on_settle: SettleCallback,
        credit_window: u32,
    ) -> Self {
        Self {
            key,
            name: name.into(),
            address: address.into(),
            publisher,
            on_settle,
            pending: HashMap::new(),
            partial: None,
            delivery_count: 0,
            credit: 0,
            credit_window: credit_window.max(1),
        }
    }

    #[must_use]
    pub fn key(&self) -> LinkKey { self.key }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    #[must_use]
    pub fn address(&self) -> &str { &self.address }

    /// Deliveries the peer sent on this link so far.
    #[must_use]
    pub fn delivery_count(&self) -> u32 { self.delivery_count }

    /// Credit the peer has left.
    #[must_use]
    pub fn credit(&self) -> u32 { self.credit }

    /// Unsettled deliveries waiting for a broker verdict.
    #[must_use]
    pub fn pending(&self) -> usize { self.pending.len() }

    /// Whether the peer's credit has fallen to half the window or below.
    #[must_use]
    pub fn needs_credit(&self) -> bool { self.credit <= self.credit_window / 2 }

    /// Restore the full credit window.
    ///
    /// Returns the `(delivery_count, link_credit)` pair to advertise in a
    /// `Flow` frame.
    pub fn replenish(&mut self) -> (u32, u32) {
        self.credit = self.credit_window;
        (self.delivery_count, self.credit)
    }

    /// Accept one transfer frame.
    ///
    /// Frames flagged `more` are buffered; the delivery is published when
    /// its final frame arrives. Returns a disposition to send when the
    /// broker refused the message synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProtocolSequence`] if the first frame of a
    /// delivery omits its delivery id while unsettled.
    pub fn on_transfer(
        &mut self,
        transfer: &Transfer,
        payload: &[u8],
    ) -> Result<Option<Disposition>, EngineError> {
        let partial = self.partial.get_or_insert_with(|| Partial {
            delivery_id: transfer.delivery_id,
            settled: transfer.settled,
            body: BytesMut::new(),
        });
        partial.body.extend_from_slice(payload);
        partial.delivery_id = partial.delivery_id.or(transfer.delivery_id);
        partial.settled |= transfer.settled;
        if transfer.more {
            return Ok(None);
        }
        let Some(Partial {
            delivery_id,
            settled,
            body,
        }) = self.partial.take()
        else {
            return Ok(None);
        };
        self.delivery_count = self.delivery_count.wrapping_add(1);
        if self.credit == 0 {
            warn!(link = %self.key, "peer sent a transfer without credit");
        }
        self.credit = self.credit.saturating_sub(1);
        match (delivery_id, settled) {
            (Some(id), settled) => Ok(self.write(id, settled, body.freeze())),
            (None, true) => {
                if let Err(error) = self.publish(body.freeze()) {
                    warn!(link = %self.key, %error, "broker refused settled message");
                }
                Ok(None)
            }
            (None, false) => Err(EngineError::sequence("transfer", "a delivery id is missing")),
        }
    }

    /// Publish a complete delivery.
    ///
    /// Pre-settled deliveries are fire-and-forget. For unsettled ones the
    /// broker's later verdict is routed back through [`settle`](Self::settle).
    /// A synchronous broker refusal of an unsettled delivery yields the
    /// rejecting disposition immediately.
    pub fn write(&mut self, delivery_id: u32, settled: bool, body: Bytes) -> Option<Disposition> {
        match self.publish(body) {
            Ok(message_id) if !settled => {
                self.pending.insert(message_id, delivery_id);
                None
            }
            Ok(_) => None,
            Err(error) => {
                warn!(link = %self.key, delivery_id, %error, "broker refused message");
                (!settled).then(|| {
                    Disposition::settled(
                        Role::Receiver,
                        delivery_id,
                        DeliveryState::Rejected {
                            error: Some(error.condition()),
                        },
                    )
                })
            }
        }
    }

    fn publish(&mut self, body: Bytes) -> Result<MessageId, EngineError> {
        let message_id = self.publisher.next_message_id();
        self.publisher
            .publish(None, message_id, body, self.on_settle.clone())?;
        Ok(message_id)
    }

    /// Translate the broker's verdict into a disposition for the peer.
    ///
    /// Returns `None` for messages that were pre-settled or already settled.
    pub fn settle(&mut self, message_id: MessageId, outcome: Settlement) -> Option<Disposition> {
        let Some(delivery_id) = self.pending.remove(&message_id) else {
            debug!(link = %self.key, %message_id, "settlement for untracked message");
            return None;
        };
        let state = match outcome {
            Settlement::Accepted => DeliveryState::Accepted,
            Settlement::Rejected(reason) => DeliveryState::Rejected {
                error: Some(ErrorCondition::new(condition::INTERNAL_ERROR, reason)),
            },
        };
        crate::metrics::inc_settled(state.label());
        Some(Disposition::settled(Role::Receiver, delivery_id, state))
    }

    /// Release the broker publisher. Pending verdicts are discarded.
    pub fn close(&mut self) {
        self.partial = None;
        self.pending.clear();
        self.publisher.close();
    }
}
