//! Unit tests for [`AmqpCodec`].

use bytes::{BufMut, Bytes, BytesMut};
use rstest::{fixture, rstest};
use tokio_util::codec::{Decoder, Encoder};

use super::*;
use crate::{
    header::{HeaderError, ProtocolHeader},
    performative::{Begin, Close, SaslFrame, SaslMechanisms, Transfer},
};

#[fixture]
fn codec() -> AmqpCodec { AmqpCodec::new(1024) }

fn encode(codec: &mut AmqpCodec, unit: impl Into<Outbound>) -> BytesMut {
    let mut buf = BytesMut::new();
    codec.encode(unit.into(), &mut buf).expect("encode");
    buf
}

fn frame_mode(mut codec: AmqpCodec) -> AmqpCodec {
    let mut header = BytesMut::from(&ProtocolHeader::AMQP.to_bytes()[..]);
    let unit = codec.decode(&mut header).expect("decode header");
    assert!(matches!(unit, Some(Inbound::Header(_))));
    codec
}

#[rstest]
fn header_is_decoded_once_then_frames(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let begin = Frame::amqp(
        3,
        Begin {
            remote_channel: None,
            next_outgoing_id: 1,
            incoming_window: 10,
            outgoing_window: 10,
            handle_max: 7,
        },
    );
    let mut bytes = encode(&mut codec, begin.clone());
    let decoded = codec.decode(&mut bytes).expect("decode frame");
    assert_eq!(decoded, Some(Inbound::Frame(begin)));
    assert!(bytes.is_empty());
}

#[rstest]
fn header_needs_all_eight_bytes(mut codec: AmqpCodec) {
    let mut partial = BytesMut::from(&b"AMQP\x00"[..]);
    assert_eq!(codec.decode(&mut partial).expect("partial header"), None);
    partial.extend_from_slice(b"\x01\x00\x00");
    assert_eq!(
        codec.decode(&mut partial).expect("full header"),
        Some(Inbound::Header(ProtocolHeader::AMQP))
    );
}

#[rstest]
fn bad_header_is_rejected(mut codec: AmqpCodec) {
    let mut bytes = BytesMut::from(&b"AMQP\x00\x02\x00\x00"[..]);
    let err = codec.decode(&mut bytes).expect_err("wrong major version");
    assert!(matches!(
        err,
        CodecError::Header(HeaderError::UnsupportedVersion { major: 2, .. })
    ));
}

#[rstest]
fn transfer_payload_follows_performative(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let transfer = Transfer {
        handle: 1,
        delivery_id: Some(4),
        delivery_tag: Some(vec![4]),
        settled: false,
        more: false,
    };
    let frame = Frame::transfer(0, transfer, Bytes::from_static(b"hello"));
    let mut bytes = encode(&mut codec, frame.clone());
    let Some(Inbound::Frame(decoded)) = codec.decode(&mut bytes).expect("decode") else {
        panic!("expected a frame");
    };
    assert_eq!(decoded, frame);
}

#[rstest]
fn incomplete_frame_waits_for_more_bytes(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let full = encode(&mut codec, Frame::amqp(0, Close::default()));
    let mut partial = BytesMut::from(&full[..full.len() - 1]);
    assert_eq!(codec.decode(&mut partial).expect("partial"), None);
    partial.extend_from_slice(&full[full.len() - 1..]);
    assert!(codec.decode(&mut partial).expect("complete").is_some());
}

#[rstest]
fn heartbeat_round_trips_as_empty_body(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let mut bytes = encode(&mut codec, Frame::heartbeat());
    assert_eq!(bytes.len(), FRAME_HEADER_LEN);
    assert_eq!(
        codec.decode(&mut bytes).expect("decode"),
        Some(Inbound::Frame(Frame::heartbeat()))
    );
}

#[rstest]
fn sasl_frames_use_their_own_type(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let frame = Frame::sasl(SaslFrame::Mechanisms(SaslMechanisms {
        mechanisms: vec!["ANONYMOUS".into()],
    }));
    let mut bytes = encode(&mut codec, frame.clone());
    assert_eq!(bytes[5], 0x01);
    assert_eq!(
        codec.decode(&mut bytes).expect("decode"),
        Some(Inbound::Frame(frame))
    );
}

#[rstest]
fn oversized_inbound_frame_is_rejected(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let mut bytes = BytesMut::new();
    bytes.put_u32(4096);
    bytes.put_u8(2);
    bytes.put_u8(0);
    bytes.put_u16(0);
    let err = codec.decode(&mut bytes).expect_err("oversized");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame { size: 4096, .. })
    ));
}

#[rstest]
#[case(4, 2)]
#[case(16, 1)]
#[case(16, 5)]
fn inconsistent_frame_header_is_rejected(codec: AmqpCodec, #[case] size: u32, #[case] doff: u8) {
    let mut codec = frame_mode(codec);
    let mut bytes = BytesMut::new();
    bytes.put_u32(size);
    bytes.put_u8(doff);
    bytes.put_u8(0);
    bytes.put_u16(0);
    bytes.put_bytes(0, 8);
    let err = codec.decode(&mut bytes).expect_err("invalid header");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::InvalidHeader { .. })
    ));
}

#[rstest]
fn unknown_frame_type_is_rejected(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let mut bytes = BytesMut::new();
    bytes.put_u32(9);
    bytes.put_u8(2);
    bytes.put_u8(0x07);
    bytes.put_u16(0);
    bytes.put_u8(0);
    let err = codec.decode(&mut bytes).expect_err("unknown type");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::UnknownFrameType(0x07))
    ));
}

#[rstest]
fn oversized_outbound_frame_is_refused(mut codec: AmqpCodec) {
    codec.set_max_outbound(512);
    let transfer = Transfer {
        handle: 0,
        delivery_id: Some(1),
        delivery_tag: None,
        settled: false,
        more: false,
    };
    let frame = Frame::transfer(0, transfer, Bytes::from(vec![0_u8; 600]));
    let mut buf = BytesMut::new();
    let err = codec
        .encode(Outbound::Frame(frame), &mut buf)
        .expect_err("frame too large");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame { max: 512, .. })
    ));
}

#[rstest]
fn eof_mid_frame_is_reported(codec: AmqpCodec) {
    let mut codec = frame_mode(codec);
    let mut bytes = BytesMut::from(&[0_u8, 0, 0][..]);
    let err = codec.decode_eof(&mut bytes).expect_err("truncated");
    assert!(matches!(
        err,
        CodecError::Eof(EofError::MidFrame { bytes_received: 3 })
    ));
}

#[rstest]
fn clean_eof_yields_none(mut codec: AmqpCodec) {
    let mut bytes = BytesMut::new();
    assert_eq!(codec.decode_eof(&mut bytes).expect("clean close"), None);
}

#[test]
fn transfer_capacity_leaves_room_for_headers() {
    let transfer = Transfer {
        handle: 0,
        delivery_id: Some(1),
        delivery_tag: Some(vec![1]),
        settled: false,
        more: true,
    };
    let capacity = transfer_capacity(512, &transfer).expect("capacity");
    assert!(capacity > 0);
    assert!(capacity < 512 - FRAME_HEADER_LEN);
}
