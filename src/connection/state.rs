//! Protocol state of a connection.

use std::fmt;

/// Stage of the connection handshake.
///
/// Variants are declared in handshake order and the state only ever moves
/// to a later one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Waiting for a protocol header.
    New,
    /// Waiting for the peer's `SaslInit`.
    Sasl,
    /// Authenticated; waiting for the plain protocol header.
    AwaitingAmqpHeader,
    /// Header accepted; waiting for the peer's `Open`.
    AwaitingOpen,
    /// `Open` exchanged; sessions may run.
    Open,
    /// No further input is processed.
    Closed,
}

impl ConnectionState {
    /// Description used in logs and sequence errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::New => "awaiting a protocol header",
            Self::Sasl => "authenticating",
            Self::AwaitingAmqpHeader => "awaiting the header after authentication",
            Self::AwaitingOpen => "awaiting open",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState;

    #[test]
    fn handshake_states_are_ordered() {
        let order = [
            ConnectionState::New,
            ConnectionState::Sasl,
            ConnectionState::AwaitingAmqpHeader,
            ConnectionState::AwaitingOpen,
            ConnectionState::Open,
            ConnectionState::Closed,
        ];
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
