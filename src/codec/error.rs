//! Error types for the codec layer.
//!
//! The taxonomy separates header negotiation failures, wire-level framing
//! problems, undecodable bodies, premature end of stream, and transport
//! errors so the connection engine can choose the matching close condition.

use std::io;

use thiserror::Error;

use crate::header::HeaderError;

/// Wire-level problems with the 8 byte frame header.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The size field exceeds the negotiated maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Size announced by the frame header.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// The size or data offset fields are inconsistent.
    #[error("invalid frame header: size {size}, data offset {doff}")]
    InvalidHeader {
        /// Size announced by the frame header.
        size: usize,
        /// Data offset in 4 byte words.
        doff: u8,
    },

    /// The frame type byte is neither the plain nor the SASL layer.
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
}

/// End of stream in the middle of a protocol unit.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// The peer closed while the protocol header was incomplete.
    #[error("premature EOF: {bytes_received} bytes of protocol header received")]
    MidHeader {
        /// Bytes buffered when the stream ended.
        bytes_received: usize,
    },

    /// The peer closed while a frame was incomplete.
    #[error("premature EOF: {bytes_received} bytes of frame received")]
    MidFrame {
        /// Bytes buffered when the stream ended.
        bytes_received: usize,
    },
}

/// Top-level codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The protocol header was refused.
    #[error("protocol header error: {0}")]
    Header(#[from] HeaderError),

    /// The frame header was invalid.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The frame body could not be decoded.
    #[error("malformed frame body: {reason}")]
    Malformed {
        /// Decoder diagnostic.
        reason: String,
    },

    /// An outbound frame body could not be encoded.
    #[error("failed to encode frame body: {reason}")]
    Encode {
        /// Encoder diagnostic.
        reason: String,
    },

    /// The stream ended inside a protocol unit.
    #[error("{0}")]
    Eof(#[from] EofError),

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the error was raised while negotiating the protocol header.
    #[must_use]
    pub fn is_header_error(&self) -> bool { matches!(self, Self::Header(_)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sizes() {
        let err = CodecError::from(FramingError::OversizedFrame { size: 70, max: 64 });
        assert_eq!(err.to_string(), "framing error: frame exceeds max length: 70 > 64");
    }

    #[test]
    fn header_errors_are_classified() {
        let err = CodecError::from(HeaderError::UnknownProtocolId(9));
        assert!(err.is_header_error());
        assert!(!CodecError::from(EofError::MidFrame { bytes_received: 3 }).is_header_error());
    }
}
