//! Typed protocol frames.
//!
//! A performative is the named body of a frame that drives the connection,
//! session, and link state machines. Bodies are encoded with `bincode` by
//! [`crate::codec`]; this module only models their fields.

use bincode::{Decode, Encode};

/// Well-known error condition symbols.
pub mod condition {
    /// Unexpected failure inside the server.
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    /// The addressed node does not exist.
    pub const NOT_FOUND: &str = "amqp:not-found";
    /// Authorization or authentication failed.
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    /// The peer sent a frame that is not permitted in the current state.
    pub const ILLEGAL_STATE: &str = "amqp:illegal-state";
    /// A frame could not be parsed.
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    /// The header or framing was invalid.
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    /// A frame referenced a handle with no attached link.
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    /// A handle was attached twice.
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    /// The broker refused the operation.
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    /// The server closed the connection on its own initiative.
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
}

/// Error details carried by `Detach`, `End`, `Close`, and `Rejected`.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ErrorCondition {
    /// Symbolic condition, for example `amqp:not-found`.
    pub condition: String,
    /// Optional human readable description.
    pub description: Option<String>,
}

impl ErrorCondition {
    /// Build a condition with a description.
    #[must_use]
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
        }
    }
}

/// Direction a peer plays on a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Role {
    /// The peer sends messages on the link.
    Sender,
    /// The peer receives messages on the link.
    Receiver,
}

impl Role {
    /// The role the other end of the link plays.
    #[must_use]
    pub const fn mirror(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

/// Node a sending link reads from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Source {
    /// Broker address of the node.
    pub address: Option<String>,
}

/// Node a receiving link writes to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Target {
    /// Broker address of the node.
    pub address: Option<String>,
}

/// Connection handshake.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Open {
    /// Container identifier of the sender.
    pub container_id: String,
    /// Virtual host requested by the client.
    pub hostname: Option<String>,
    /// Largest frame the sender accepts.
    pub max_frame_size: u32,
    /// Highest channel number the sender accepts.
    pub channel_max: u16,
    /// Idle timeout in milliseconds.
    pub idle_time_out: Option<u32>,
}

/// Session start.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Begin {
    /// Channel of the remote `Begin` this one answers.
    pub remote_channel: Option<u16>,
    /// First transfer id the sender will use.
    pub next_outgoing_id: u32,
    /// Incoming transfer window.
    pub incoming_window: u32,
    /// Outgoing transfer window.
    pub outgoing_window: u32,
    /// Highest link handle the sender accepts.
    pub handle_max: u32,
}

/// Link attachment.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Attach {
    /// Link name, unique per container pair.
    pub name: String,
    /// Handle chosen by the sender of this frame.
    pub handle: u32,
    /// Role of the sender of this frame.
    pub role: Role,
    /// Source terminus.
    pub source: Option<Source>,
    /// Target terminus.
    pub target: Option<Target>,
    /// Delivery count of a sending endpoint.
    pub initial_delivery_count: Option<u32>,
}

/// Session and link flow control.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Flow {
    /// Next transfer id expected from the receiver of this frame.
    pub next_incoming_id: Option<u32>,
    /// Session incoming window.
    pub incoming_window: u32,
    /// Next transfer id the sender of this frame will use.
    pub next_outgoing_id: u32,
    /// Session outgoing window.
    pub outgoing_window: u32,
    /// Link the frame refers to; `None` for session-only flow.
    pub handle: Option<u32>,
    /// Link delivery count.
    pub delivery_count: Option<u32>,
    /// Link credit granted to the sender.
    pub link_credit: Option<u32>,
    /// Ask the sender to use up or discard outstanding credit.
    pub drain: bool,
    /// Ask the receiver of this frame to reply with its own state.
    pub echo: bool,
}

/// Message transfer. The message bytes travel as the frame payload.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Transfer {
    /// Link handle.
    pub handle: u32,
    /// Session scoped delivery id; present on the first frame of a delivery.
    pub delivery_id: Option<u32>,
    /// Opaque delivery tag.
    pub delivery_tag: Option<Vec<u8>>,
    /// Delivery is settled by the sender.
    pub settled: bool,
    /// Further frames of the same delivery follow.
    pub more: bool,
}

/// Terminal or intermediate outcome of a delivery.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum DeliveryState {
    /// The message was processed.
    Accepted,
    /// The message is invalid and must not be redelivered.
    Rejected {
        /// Optional reason.
        error: Option<ErrorCondition>,
    },
    /// The message was not processed and may be redelivered.
    Released,
    /// The message was not processed and was modified.
    Modified {
        /// Count the attempt as a failed delivery.
        delivery_failed: bool,
        /// Do not redeliver to this link.
        undeliverable_here: bool,
    },
}

impl DeliveryState {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Released => "released",
            Self::Modified { .. } => "modified",
        }
    }
}

/// Delivery settlement.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Disposition {
    /// Role of the sender of this frame.
    pub role: Role,
    /// First delivery id covered.
    pub first: u32,
    /// Last delivery id covered; `None` means `first`.
    pub last: Option<u32>,
    /// The deliveries are settled by the sender of this frame.
    pub settled: bool,
    /// Outcome applied to the deliveries.
    pub state: Option<DeliveryState>,
}

impl Disposition {
    /// A settled disposition covering a single delivery.
    #[must_use]
    pub fn settled(role: Role, delivery_id: u32, state: DeliveryState) -> Self {
        Self {
            role,
            first: delivery_id,
            last: None,
            settled: true,
            state: Some(state),
        }
    }

    /// Inclusive id range covered by the frame.
    #[must_use]
    pub fn range(&self) -> (u32, u32) { (self.first, self.last.unwrap_or(self.first)) }
}

/// Link detachment.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Detach {
    /// Link handle.
    pub handle: u32,
    /// The link is closed rather than suspended.
    pub closed: bool,
    /// Reason for an abnormal detach.
    pub error: Option<ErrorCondition>,
}

/// Session end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct End {
    /// Reason for an abnormal end.
    pub error: Option<ErrorCondition>,
}

/// Connection close.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Close {
    /// Reason for an abnormal close.
    pub error: Option<ErrorCondition>,
}

/// Any frame body of the plain protocol layer.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    /// Frame name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Begin(_) => "begin",
            Self::Attach(_) => "attach",
            Self::Flow(_) => "flow",
            Self::Transfer(_) => "transfer",
            Self::Disposition(_) => "disposition",
            Self::Detach(_) => "detach",
            Self::End(_) => "end",
            Self::Close(_) => "close",
        }
    }
}

macro_rules! impl_from_performative {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Performative {
                fn from(value: $variant) -> Self { Self::$variant(value) }
            }
        )*
    };
}

impl_from_performative!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);

/// Authentication result codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum SaslCode {
    /// Authentication succeeded.
    Ok,
    /// Credentials were rejected.
    Auth,
    /// Unspecified system error.
    Sys,
    /// Permanent system error.
    SysPerm,
    /// Transient system error.
    SysTemp,
}

/// Mechanisms offered by the server.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SaslMechanisms {
    /// Mechanism names in preference order.
    pub mechanisms: Vec<String>,
}

/// Mechanism selection and initial response from the client.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SaslInit {
    /// Selected mechanism.
    pub mechanism: String,
    /// Mechanism specific credentials.
    pub initial_response: Option<Vec<u8>>,
    /// Virtual host requested by the client.
    pub hostname: Option<String>,
}

/// Final authentication verdict.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SaslOutcome {
    /// Result code.
    pub code: SaslCode,
    /// Mechanism specific data.
    pub additional_data: Option<Vec<u8>>,
}

/// Any frame body of the SASL layer.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum SaslFrame {
    Mechanisms(SaslMechanisms),
    Init(SaslInit),
    Outcome(SaslOutcome),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Role::Sender, Role::Receiver)]
    #[case(Role::Receiver, Role::Sender)]
    fn mirror_swaps_roles(#[case] role: Role, #[case] expected: Role) {
        assert_eq!(role.mirror(), expected);
        assert_eq!(role.mirror().mirror(), role);
    }

    #[test]
    fn disposition_range_defaults_last_to_first() {
        let single = Disposition::settled(Role::Receiver, 7, DeliveryState::Accepted);
        assert_eq!(single.range(), (7, 7));
        let span = Disposition {
            last: Some(9),
            ..single
        };
        assert_eq!(span.range(), (7, 9));
    }
}
