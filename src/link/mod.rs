//! Link engines.
//!
//! A link is a unidirectional channel inside a session, identified by the
//! handle the peer chose at attach time. The server side of a link is one of
//! two variants:
//!
//! - [`PublishLink`]: the peer sends, the server publishes into the broker.
//! - [`SubscribeLink`]: the broker delivers, the server transfers to the peer
//!   under link credit.
//!
//! Each variant exposes only the operations meaningful for its direction.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::performative::Role;

mod publish;
mod subscribe;

pub use publish::PublishLink;
pub use subscribe::SubscribeLink;

/// Identity of an attached link as seen by broker callbacks.
///
/// Handles are reused once detached, within a session and across the
/// sessions of one connection, so broker events also carry the attach
/// epoch. Epochs are unique for the life of the process; an event whose
/// epoch no longer matches the link at that handle is stale and dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkKey {
    /// Handle assigned by the peer.
    pub handle: u32,
    /// Process-unique attach counter.
    pub epoch: u64,
}

impl LinkKey {
    /// Key for a fresh attach at `handle`.
    #[must_use]
    pub fn attach(handle: u32) -> Self {
        static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);
        Self {
            handle,
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.handle, self.epoch)
    }
}

/// Server endpoint of an attached link.
pub enum Link {
    /// Peer to broker.
    Publish(PublishLink),
    /// Broker to peer.
    Subscribe(SubscribeLink),
}

impl Link {
    /// Key identifying this attachment.
    #[must_use]
    pub fn key(&self) -> LinkKey {
        match self {
            Self::Publish(link) => link.key(),
            Self::Subscribe(link) => link.key(),
        }
    }

    /// Handle assigned by the peer.
    #[must_use]
    pub fn handle(&self) -> u32 { self.key().handle }

    /// Link name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Publish(link) => link.name(),
            Self::Subscribe(link) => link.name(),
        }
    }

    /// Broker address the link is bound to.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Publish(link) => link.address(),
            Self::Subscribe(link) => link.address(),
        }
    }

    /// Role the server plays on this link.
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Publish(_) => Role::Receiver,
            Self::Subscribe(_) => Role::Sender,
        }
    }

    /// Release the broker endpoint.
    pub fn close(&mut self) {
        match self {
            Self::Publish(link) => link.close(),
            Self::Subscribe(link) => link.close(),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("key", &self.key())
            .field("name", &self.name())
            .field("address", &self.address())
            .field("role", &self.role())
            .finish()
    }
}
