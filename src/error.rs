//! Canonical error type for the protocol engine.
//!
//! `EngineError` covers every way a connection can fail. Each variant maps
//! to the protocol [`ErrorCondition`] reported in the `Close` frame once the
//! connection is open; before that, failures close the socket silently.

use std::io;

use thiserror::Error;

use crate::{
    broker::BrokerError,
    codec::CodecError,
    header::HeaderError,
    performative::{ErrorCondition, condition},
};

/// Errors raised while driving a connection.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The protocol header was refused.
    #[error("protocol header error: {0}")]
    ProtocolHeader(#[from] HeaderError),

    /// A frame arrived that is not valid in the current state.
    #[error("unexpected {frame} frame while {state}")]
    ProtocolSequence {
        /// Name of the offending frame.
        frame: &'static str,
        /// Description of the state it arrived in.
        state: &'static str,
    },

    /// A frame referenced a handle with no attached link.
    #[error("no link attached at handle {handle}")]
    UnknownLinkHandle {
        /// Handle named by the frame.
        handle: u32,
    },

    /// An `Attach` reused a handle that is still attached.
    #[error("handle {handle} is already attached")]
    HandleInUse {
        /// Handle named by the frame.
        handle: u32,
    },

    /// Every delivery id of the session has been used.
    #[error("the session has used every delivery id")]
    DeliveryIdsExhausted,

    /// The broker failed in a way the link could not absorb.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// SASL authentication was refused.
    #[error("authentication failed for mechanism {mechanism}")]
    Authentication {
        /// Mechanism selected by the peer.
        mechanism: String,
    },

    /// A frame could not be decoded or encoded.
    #[error("codec error: {0}")]
    Codec(CodecError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for EngineError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Header(header) => Self::ProtocolHeader(header),
            CodecError::Io(io) => Self::Io(io),
            other => Self::Codec(other),
        }
    }
}

impl EngineError {
    /// Build a [`EngineError::ProtocolSequence`].
    #[must_use]
    pub const fn sequence(frame: &'static str, state: &'static str) -> Self {
        Self::ProtocolSequence { frame, state }
    }

    /// Protocol error condition reported to the peer in `Close`.
    #[must_use]
    pub fn condition(&self) -> ErrorCondition {
        let symbol = match self {
            Self::ProtocolHeader(_) => condition::FRAMING_ERROR,
            Self::ProtocolSequence { .. } => condition::ILLEGAL_STATE,
            Self::UnknownLinkHandle { .. } => condition::UNATTACHED_HANDLE,
            Self::HandleInUse { .. } => condition::HANDLE_IN_USE,
            Self::DeliveryIdsExhausted => condition::RESOURCE_LIMIT_EXCEEDED,
            Self::Broker(broker) => return broker.condition(),
            Self::Authentication { .. } => condition::UNAUTHORIZED_ACCESS,
            Self::Codec(CodecError::Malformed { .. }) => condition::DECODE_ERROR,
            Self::Codec(_) => condition::FRAMING_ERROR,
            Self::Io(_) => condition::INTERNAL_ERROR,
        };
        ErrorCondition::new(symbol, self.to_string())
    }

    /// Whether the peer should still be sent a `Close` for this error.
    ///
    /// Transport failures leave nothing to write to.
    #[must_use]
    pub fn is_reportable(&self) -> bool { !matches!(self, Self::Io(_)) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::codec::{EofError, FramingError};

    #[rstest]
    #[case(EngineError::sequence("transfer", "awaiting open"), condition::ILLEGAL_STATE)]
    #[case(EngineError::UnknownLinkHandle { handle: 4 }, condition::UNATTACHED_HANDLE)]
    #[case(EngineError::HandleInUse { handle: 4 }, condition::HANDLE_IN_USE)]
    #[case(EngineError::DeliveryIdsExhausted, condition::RESOURCE_LIMIT_EXCEEDED)]
    #[case(
        EngineError::from(BrokerError::NotFound { address: "q".into() }),
        condition::NOT_FOUND
    )]
    #[case(
        EngineError::from(CodecError::Malformed { reason: "eof".into() }),
        condition::DECODE_ERROR
    )]
    #[case(
        EngineError::from(CodecError::from(FramingError::UnknownFrameType(9))),
        condition::FRAMING_ERROR
    )]
    fn errors_map_to_conditions(#[case] error: EngineError, #[case] expected: &str) {
        assert_eq!(error.condition().condition, expected);
    }

    #[test]
    fn codec_header_errors_become_protocol_header_errors() {
        let err = EngineError::from(CodecError::from(HeaderError::UnknownProtocolId(1)));
        assert!(matches!(err, EngineError::ProtocolHeader(_)));
    }

    #[test]
    fn transport_errors_are_not_reported() {
        let err = EngineError::from(CodecError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!err.is_reportable());
        assert!(EngineError::from(CodecError::from(EofError::MidFrame { bytes_received: 1 })).is_reportable());
    }

    #[test]
    fn sequence_error_names_frame_and_state() {
        assert_eq!(
            EngineError::sequence("begin", "a session is active").to_string(),
            "unexpected begin frame while a session is active"
        );
    }
}
