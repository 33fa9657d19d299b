//! Inputs observed by the connection loop.

use crate::{broker::BrokerEvent, codec::Inbound};

/// One unit of work for [`Connection::process_next`](super::Connection::process_next).
#[derive(Debug)]
pub(super) enum Input {
    /// A header or frame from the peer.
    Unit(Inbound),
    /// A callback from the broker.
    Broker(BrokerEvent),
    /// The server is shutting down.
    Shutdown,
    /// The peer closed the transport.
    Eof,
}
