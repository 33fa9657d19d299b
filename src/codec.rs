//! Framing codec for the wire protocol.
//!
//! A connection carries two kinds of protocol unit: the 8 byte protocol
//! header, exchanged once per security layer, and frames. Each frame starts
//! with an 8 byte header (`size: u32`, `doff: u8`, `type: u8`,
//! `channel: u16`, all big-endian) followed by the body at `doff * 4`. Plain
//! layer bodies hold a performative and, for transfers, the message payload
//! after it; SASL bodies hold a single SASL frame. An empty plain body is a
//! heartbeat.
//!
//! Performative values are encoded with `bincode`'s standard configuration.
//! The codec is the only place that knows about byte layout; the engines
//! work with [`Frame`] values.

use bincode::config::{self, Configuration};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    header::{HEADER_LEN, ProtocolHeader},
    performative::{Performative, SaslFrame, Transfer},
};

pub mod error;

pub use error::{CodecError, EofError, FramingError};

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Smallest maximum frame size a peer may negotiate.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default maximum frame size advertised by the server.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024;

const DATA_OFFSET_WORDS: u8 = 2;
const TYPE_AMQP: u8 = 0x00;
const TYPE_SASL: u8 = 0x01;

/// Clamp a configured frame size to the protocol minimum.
#[must_use]
pub fn clamp_frame_size(value: u32) -> u32 { value.max(MIN_MAX_FRAME_SIZE) }

fn body_config() -> Configuration { config::standard() }

/// Body of a decoded or outgoing frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameBody {
    /// Heartbeat frame with no body.
    Empty,
    /// Plain layer frame with its trailing payload.
    Amqp {
        /// Frame performative.
        performative: Performative,
        /// Message bytes following a transfer; empty otherwise.
        payload: Bytes,
    },
    /// SASL layer frame.
    Sasl(SaslFrame),
}

/// A frame addressed to a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Channel number; always `0` for SASL frames.
    pub channel: u16,
    /// Frame body.
    pub body: FrameBody,
}

impl Frame {
    /// Plain layer frame without payload.
    #[must_use]
    pub fn amqp(channel: u16, performative: impl Into<Performative>) -> Self {
        Self {
            channel,
            body: FrameBody::Amqp {
                performative: performative.into(),
                payload: Bytes::new(),
            },
        }
    }

    /// Transfer frame carrying message bytes.
    #[must_use]
    pub fn transfer(channel: u16, transfer: Transfer, payload: Bytes) -> Self {
        Self {
            channel,
            body: FrameBody::Amqp {
                performative: Performative::Transfer(transfer),
                payload,
            },
        }
    }

    /// SASL layer frame.
    #[must_use]
    pub fn sasl(frame: SaslFrame) -> Self {
        Self {
            channel: 0,
            body: FrameBody::Sasl(frame),
        }
    }

    /// Empty heartbeat frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }

    /// Performative carried by the frame, if any.
    #[must_use]
    pub fn performative(&self) -> Option<&Performative> {
        match &self.body {
            FrameBody::Amqp { performative, .. } => Some(performative),
            FrameBody::Empty | FrameBody::Sasl(_) => None,
        }
    }
}

/// Unit produced by the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A validated protocol header.
    Header(ProtocolHeader),
    /// A complete frame.
    Frame(Frame),
}

/// Unit accepted by the encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A protocol header echo.
    Header(ProtocolHeader),
    /// A frame.
    Frame(Frame),
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self { Self::Frame(frame) }
}

/// Number of payload bytes that fit in one transfer frame.
///
/// Returns `0` when the transfer performative alone fills the frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the performative cannot be encoded.
pub fn transfer_capacity(max_frame_size: u32, transfer: &Transfer) -> Result<usize, CodecError> {
    let performative = Performative::Transfer(transfer.clone());
    let body = bincode::encode_to_vec(&performative, body_config()).map_err(|e| {
        CodecError::Encode {
            reason: e.to_string(),
        }
    })?;
    let max = usize::try_from(max_frame_size).unwrap_or(usize::MAX);
    Ok(max.saturating_sub(FRAME_HEADER_LEN + body.len()))
}

/// Codec translating between bytes and [`Inbound`]/[`Outbound`] units.
///
/// The decoder starts in header mode and switches to frame mode once a
/// header has been read. The connection re-arms header mode after a
/// successful SASL exchange with [`expect_header`](Self::expect_header).
#[derive(Clone, Debug)]
pub struct AmqpCodec {
    expect_header: bool,
    max_inbound: u32,
    max_outbound: u32,
}

impl AmqpCodec {
    /// Create a codec accepting frames up to `max_frame_size` bytes.
    #[must_use]
    pub fn new(max_frame_size: u32) -> Self {
        let max = clamp_frame_size(max_frame_size);
        Self {
            expect_header: true,
            max_inbound: max,
            max_outbound: max,
        }
    }

    /// Decode a protocol header as the next unit.
    pub fn expect_header(&mut self) { self.expect_header = true; }

    /// Limit outbound frames to the size negotiated with the peer.
    pub fn set_max_outbound(&mut self, max_frame_size: u32) {
        self.max_outbound = clamp_frame_size(max_frame_size);
    }

    /// Largest frame the peer accepts.
    #[must_use]
    pub fn max_outbound(&self) -> u32 { self.max_outbound }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, CodecError> {
        let Some(raw) = src
            .get(..HEADER_LEN)
            .and_then(|slice| <[u8; HEADER_LEN]>::try_from(slice).ok())
        else {
            return Ok(None);
        };
        let header = ProtocolHeader::parse(raw)?;
        src.advance(HEADER_LEN);
        self.expect_header = false;
        Ok(Some(Inbound::Header(header)))
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, CodecError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = &src[..FRAME_HEADER_LEN];
        let size = header.get_u32() as usize;
        let doff = header.get_u8();
        let frame_type = header.get_u8();
        let channel = header.get_u16();

        let body_offset = usize::from(doff) * 4;
        if size < FRAME_HEADER_LEN || body_offset < FRAME_HEADER_LEN || body_offset > size {
            return Err(FramingError::InvalidHeader { size, doff }.into());
        }
        let max = self.max_inbound as usize;
        if size > max {
            return Err(FramingError::OversizedFrame { size, max }.into());
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(size).freeze();
        body.advance(body_offset);
        let body = decode_body(frame_type, body)?;
        Ok(Some(Inbound::Frame(Frame { channel, body })))
    }

    fn encode_frame(&self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let (frame_type, body, payload) = match frame.body {
            FrameBody::Empty => (TYPE_AMQP, Vec::new(), Bytes::new()),
            FrameBody::Amqp {
                performative,
                payload,
            } => (TYPE_AMQP, encode_body(&performative)?, payload),
            FrameBody::Sasl(sasl) => (TYPE_SASL, encode_body(&sasl)?, Bytes::new()),
        };
        let size = FRAME_HEADER_LEN + body.len() + payload.len();
        let max = self.max_outbound as usize;
        if size > max {
            return Err(FramingError::OversizedFrame { size, max }.into());
        }
        let wire_size = u32::try_from(size)
            .map_err(|_| CodecError::from(FramingError::OversizedFrame { size, max }))?;

        dst.reserve(size);
        dst.put_u32(wire_size);
        dst.put_u8(DATA_OFFSET_WORDS);
        dst.put_u8(frame_type);
        dst.put_u16(frame.channel);
        dst.extend_from_slice(&body);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Default for AmqpCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_SIZE) }
}

fn encode_body<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::encode_to_vec(value, body_config()).map_err(|e| CodecError::Encode {
        reason: e.to_string(),
    })
}

fn decode_body(frame_type: u8, body: Bytes) -> Result<FrameBody, CodecError> {
    let malformed = |e: bincode::error::DecodeError| CodecError::Malformed {
        reason: e.to_string(),
    };
    match frame_type {
        TYPE_AMQP if body.is_empty() => Ok(FrameBody::Empty),
        TYPE_AMQP => {
            let (performative, used) =
                bincode::decode_from_slice::<Performative, _>(&body, body_config())
                    .map_err(malformed)?;
            Ok(FrameBody::Amqp {
                performative,
                payload: body.slice(used..),
            })
        }
        TYPE_SASL => {
            let (sasl, _) =
                bincode::decode_from_slice::<SaslFrame, _>(&body, body_config()).map_err(malformed)?;
            Ok(FrameBody::Sasl(sasl))
        }
        other => Err(FramingError::UnknownFrameType(other).into()),
    }
}

impl Decoder for AmqpCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.expect_header {
            self.decode_header(src)
        } else {
            self.decode_frame(src)
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(unit) = self.decode(src)? {
            return Ok(Some(unit));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let bytes_received = src.len();
        // The partial unit can never complete; drop it so the stream ends.
        src.clear();
        if self.expect_header {
            Err(EofError::MidHeader { bytes_received }.into())
        } else {
            Err(EofError::MidFrame { bytes_received }.into())
        }
    }
}

impl Encoder<Outbound> for AmqpCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outbound::Header(header) => {
                dst.extend_from_slice(&header.to_bytes());
                Ok(())
            }
            Outbound::Frame(frame) => self.encode_frame(frame, dst),
        }
    }
}

#[cfg(test)]
mod tests;
