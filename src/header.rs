//! Protocol header negotiation.
//!
//! Every connection opens with an eight byte header: the literal `AMQP`, a
//! protocol identifier selecting the plain or SASL-secured layer, and the
//! version triple `1.0.0`. The server validates the header and echoes the
//! identical bytes before any frame is exchanged.

use thiserror::Error;

/// Length of the protocol header in bytes.
pub const HEADER_LEN: usize = 8;

const MAGIC: [u8; 4] = *b"AMQP";
const VERSION: [u8; 3] = [1, 0, 0];

/// Protocol layer selected by the header's identifier byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    /// Plain protocol (`0x00`).
    Amqp,
    /// SASL security layer (`0x03`).
    Sasl,
}

impl ProtocolId {
    /// Wire value of the identifier.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Amqp => 0x00,
            Self::Sasl => 0x03,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Amqp),
            0x03 => Some(Self::Sasl),
            _ => None,
        }
    }
}

/// Reasons a protocol header is refused.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// The first four bytes were not `AMQP`.
    #[error("invalid protocol magic {0:?}")]
    BadMagic([u8; 4]),
    /// The identifier byte named neither the plain nor the SASL layer.
    #[error("unknown protocol id {0:#04x}")]
    UnknownProtocolId(u8),
    /// The version triple was not `1.0.0`.
    #[error("unsupported protocol version {major}.{minor}.{revision}")]
    UnsupportedVersion {
        /// Major version requested by the peer.
        major: u8,
        /// Minor version requested by the peer.
        minor: u8,
        /// Revision requested by the peer.
        revision: u8,
    },
}

/// A validated protocol header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolHeader {
    id: ProtocolId,
}

impl ProtocolHeader {
    /// Header selecting the plain protocol layer.
    pub const AMQP: Self = Self {
        id: ProtocolId::Amqp,
    };

    /// Header selecting the SASL layer.
    pub const SASL: Self = Self {
        id: ProtocolId::Sasl,
    };

    /// Validate the raw header bytes received from a peer.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the magic, identifier, or version do
    /// not match exactly.
    ///
    /// # Examples
    ///
    /// ```
    /// use amqpframe::header::{ProtocolHeader, ProtocolId};
    ///
    /// let header = ProtocolHeader::parse(*b"AMQP\x03\x01\x00\x00").expect("valid header");
    /// assert_eq!(header.id(), ProtocolId::Sasl);
    /// assert!(ProtocolHeader::parse(*b"AMQP\x00\x02\x00\x00").is_err());
    /// ```
    pub fn parse(bytes: [u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        let [m0, m1, m2, m3, id, major, minor, revision] = bytes;
        let magic = [m0, m1, m2, m3];
        if magic != MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }
        let id = ProtocolId::from_u8(id).ok_or(HeaderError::UnknownProtocolId(id))?;
        if [major, minor, revision] != VERSION {
            return Err(HeaderError::UnsupportedVersion {
                major,
                minor,
                revision,
            });
        }
        Ok(Self { id })
    }

    /// Protocol layer requested by this header.
    #[must_use]
    pub const fn id(self) -> ProtocolId { self.id }

    /// Wire representation, identical to the bytes accepted by [`parse`](Self::parse).
    #[must_use]
    pub const fn to_bytes(self) -> [u8; HEADER_LEN] {
        let [m0, m1, m2, m3] = MAGIC;
        let [major, minor, revision] = VERSION;
        [m0, m1, m2, m3, self.id.as_u8(), major, minor, revision]
    }
}
