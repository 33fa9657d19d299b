//! Broker collaborator contract.
//!
//! The engine bridges links to a backing broker through the [`Broker`],
//! [`Publisher`], and [`Subscriber`] traits. Broker objects are shared across
//! connections and handle their own synchronisation. Asynchronous callbacks
//! from the broker ([`MessageHandler`] and [`SettleCallback`]) never touch
//! connection state directly: they post a [`BrokerEvent`] to the owning
//! connection task, which processes it in order with inbound frames.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    link::LinkKey,
    performative::{ErrorCondition, condition},
};

pub mod memory;

pub use memory::MemoryBroker;

/// Broker-assigned message identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl From<u64> for MessageId {
    fn from(value: u64) -> Self { Self(value) }
}

impl MessageId {
    /// Create a new [`MessageId`].
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub const fn as_u64(self) -> u64 { self.0 }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "MessageId({})", self.0) }
}

/// Transaction identifier passed through to the broker.
///
/// Transactions are not negotiated by the engine, so this is always `None`.
pub type TxId = Option<u64>;

/// Errors reported by the broker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// No node exists at the address.
    #[error("unknown address: {address}")]
    NotFound {
        /// Address requested by the link.
        address: String,
    },
    /// The broker cannot serve the request right now.
    #[error("broker unavailable: {reason}")]
    Unavailable {
        /// Diagnostic from the broker.
        reason: String,
    },
    /// The broker refused the message or operation.
    #[error("broker rejected request: {reason}")]
    Rejected {
        /// Diagnostic from the broker.
        reason: String,
    },
    /// The message id is not outstanding on this subscriber.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

impl BrokerError {
    /// Protocol error condition reported to the peer.
    #[must_use]
    pub fn condition(&self) -> ErrorCondition {
        let symbol = match self {
            Self::NotFound { .. } => condition::NOT_FOUND,
            Self::Unavailable { .. } => condition::RESOURCE_LIMIT_EXCEEDED,
            Self::Rejected { .. } | Self::UnknownMessage(_) => condition::INTERNAL_ERROR,
        };
        ErrorCondition::new(symbol, self.to_string())
    }
}

/// Final broker verdict on a published message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// The broker stored the message.
    Accepted,
    /// The broker refused the message.
    Rejected(String),
}

/// Event posted by broker callbacks to the owning connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A message is ready for a subscribe link.
    Message {
        /// Link the subscriber was created for.
        link: LinkKey,
        /// Broker identifier of the message.
        message_id: MessageId,
        /// Message bytes.
        body: Bytes,
    },
    /// A message published on a publish link was settled.
    Settled {
        /// Link the publisher was created for.
        link: LinkKey,
        /// Broker identifier of the message.
        message_id: MessageId,
        /// Broker verdict.
        outcome: Settlement,
    },
}

/// Sending half of a connection's broker event channel.
pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;

/// Receiving half of a connection's broker event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

/// Delivers broker messages to a subscribe link.
#[derive(Clone, Debug)]
pub struct MessageHandler {
    link: LinkKey,
    events: EventSender,
}

impl MessageHandler {
    /// Create a handler that posts messages for `link` to `events`.
    #[must_use]
    pub fn new(link: LinkKey, events: EventSender) -> Self { Self { link, events } }

    /// Hand a message to the link.
    ///
    /// Returns `false` once the connection has gone away; the broker should
    /// then keep the message for another consumer.
    pub fn on_message(&self, message_id: MessageId, body: Bytes) -> bool {
        self.events
            .send(BrokerEvent::Message {
                link: self.link,
                message_id,
                body,
            })
            .is_ok()
    }

    /// Whether the owning connection has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.events.is_closed() }
}

/// Reports the broker's verdict on a published message.
#[derive(Clone, Debug)]
pub struct SettleCallback {
    link: LinkKey,
    events: EventSender,
}

impl SettleCallback {
    /// Create a callback that posts settlements for `link` to `events`.
    #[must_use]
    pub fn new(link: LinkKey, events: EventSender) -> Self { Self { link, events } }

    /// The broker accepted the message.
    pub fn on_accepted(&self, message_id: MessageId) { self.settle(message_id, Settlement::Accepted); }

    /// The broker rejected the message.
    pub fn on_rejected(&self, message_id: MessageId, reason: impl Into<String>) {
        self.settle(message_id, Settlement::Rejected(reason.into()));
    }

    fn settle(&self, message_id: MessageId, outcome: Settlement) {
        // A closed channel means the connection is gone and nobody is owed a
        // disposition any more.
        let _ = self.events.send(BrokerEvent::Settled {
            link: self.link,
            message_id,
            outcome,
        });
    }
}

/// Backing broker shared by all connections.
pub trait Broker: Send + Sync + 'static {
    /// Bind a publisher to `address` for a publish link.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the address is unknown or the broker
    /// refuses the link.
    fn create_sender(&self, address: &str) -> Result<Box<dyn Publisher>, BrokerError>;

    /// Bind a subscriber to `address` for a subscribe link.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the address is unknown or the broker
    /// refuses the link.
    fn create_receiver(
        &self,
        address: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscriber>, BrokerError>;
}

/// Broker-side endpoint of a publish link.
pub trait Publisher: Send {
    /// Allocate the identifier for the next published message.
    fn next_message_id(&mut self) -> MessageId;

    /// Publish `body` under an id obtained from [`next_message_id`](Self::next_message_id).
    ///
    /// The broker must eventually call `on_settle` exactly once for the
    /// message unless publishing fails synchronously.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the broker refuses the message outright.
    fn publish(
        &mut self,
        tx_id: TxId,
        message_id: MessageId,
        body: Bytes,
        on_settle: SettleCallback,
    ) -> Result<(), BrokerError>;

    /// Release broker resources held for the link.
    fn close(&mut self) {}
}

/// Broker-side endpoint of a subscribe link.
pub trait Subscriber: Send {
    /// Report the remote receiver's credit.
    fn flow(&mut self, tx_id: TxId, delivery_count: u32, credit: u32);

    /// The remote accepted the message.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the message is not outstanding.
    fn accept(&mut self, tx_id: TxId, message_id: MessageId) -> Result<(), BrokerError>;

    /// The remote rejected the message.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the message is not outstanding.
    fn reject(
        &mut self,
        tx_id: TxId,
        message_id: MessageId,
        error: Option<&ErrorCondition>,
    ) -> Result<(), BrokerError>;

    /// The remote released the message for redelivery.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the message is not outstanding.
    fn release(&mut self, tx_id: TxId, message_id: MessageId) -> Result<(), BrokerError>;

    /// The remote modified the message.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the message is not outstanding.
    fn modified(
        &mut self,
        tx_id: TxId,
        message_id: MessageId,
        delivery_failed: bool,
        undeliverable_here: bool,
    ) -> Result<(), BrokerError>;

    /// Release broker resources held for the link.
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn key(handle: u32) -> LinkKey { LinkKey { handle, epoch: 1 } }

    #[test]
    fn callbacks_post_events_for_their_link() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        MessageHandler::new(key(3), tx.clone()).on_message(MessageId::new(9), Bytes::from_static(b"m"));
        SettleCallback::new(key(4), tx).on_rejected(MessageId::new(10), "full");

        assert_eq!(
            rx.try_recv().expect("message event"),
            BrokerEvent::Message {
                link: key(3),
                message_id: MessageId::new(9),
                body: Bytes::from_static(b"m"),
            }
        );
        assert_eq!(
            rx.try_recv().expect("settle event"),
            BrokerEvent::Settled {
                link: key(4),
                message_id: MessageId::new(10),
                outcome: Settlement::Rejected("full".into()),
            }
        );
    }

    #[test]
    fn handler_reports_closed_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = MessageHandler::new(key(0), tx);
        drop(rx);
        assert!(handler.is_closed());
        assert!(!handler.on_message(MessageId::new(1), Bytes::new()));
    }

    #[test]
    fn not_found_maps_to_not_found_condition() {
        let err = BrokerError::NotFound {
            address: "queue/x".into(),
        };
        assert_eq!(err.condition().condition, condition::NOT_FOUND);
    }
}
