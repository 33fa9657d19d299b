//! Tests for `amqpframe` metrics.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.

use std::sync::Arc;

use amqpframe::{
    EngineConfig,
    codec::{Frame, Outbound},
    header::ProtocolHeader,
    metrics::{self as engine_metrics, Direction},
    performative::Close,
};
use amqpframe_testing::{
    RecordingBroker,
    counter_value,
    drive_connection,
    encode_units,
    gauge_value,
    open_frame,
    with_recorder,
};
use rstest::rstest;

#[rstest]
#[case(Direction::Inbound, "inbound")]
#[case(Direction::Outbound, "outbound")]
fn frame_metric_is_labelled_by_direction(#[case] direction: Direction, #[case] label: &str) {
    let recorded = with_recorder(|| engine_metrics::inc_frames(direction));
    assert_eq!(
        counter_value(&recorded, engine_metrics::FRAMES_PROCESSED, &[("direction", label)]),
        1
    );
}

#[rstest]
#[case(1)]
#[case(3)]
fn connection_panics_are_counted(#[case] expected: u64) {
    let recorded =
        with_recorder(|| (0..expected).for_each(|_| engine_metrics::inc_connection_panics()));
    assert_eq!(counter_value(&recorded, engine_metrics::CONNECTION_PANICS, &[]), expected);
}

#[test]
fn settled_deliveries_are_labelled_by_outcome() {
    let recorded = with_recorder(|| {
        engine_metrics::inc_settled("accepted");
        engine_metrics::inc_settled("accepted");
        engine_metrics::inc_settled("rejected");
    });
    let count = |outcome| {
        counter_value(&recorded, engine_metrics::DELIVERIES_SETTLED, &[("outcome", outcome)])
    };
    assert_eq!(count("accepted"), 2);
    assert_eq!(count("rejected"), 1);
}

fn run_connection(input: Vec<Vec<u8>>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime
        .block_on(drive_connection(
            Arc::new(RecordingBroker::new()),
            EngineConfig::default(),
            input,
        ))
        .expect("drive connection");
}

#[test]
fn a_full_connection_records_frames_and_balances_the_gauge() {
    let input = encode_units([
        Outbound::Header(ProtocolHeader::AMQP),
        Frame::amqp(0, open_frame()).into(),
        Frame::amqp(0, Close::default()).into(),
    ])
    .expect("encode");
    let recorded = with_recorder(|| run_connection(input));

    let frames = |label| {
        counter_value(&recorded, engine_metrics::FRAMES_PROCESSED, &[("direction", label)])
    };
    // The header counts as an inbound unit; the echo is written directly.
    assert_eq!(frames("inbound"), 3);
    assert_eq!(frames("outbound"), 2);
    assert_eq!(gauge_value(&recorded, engine_metrics::CONNECTIONS_ACTIVE), Some(0.0));
    assert_eq!(counter_value(&recorded, engine_metrics::ERRORS_TOTAL, &[]), 0);
}

#[test]
fn a_rejected_header_counts_as_an_error() {
    let recorded = with_recorder(|| run_connection(vec![b"AMQP\x00\x02\x00\x00".to_vec()]));
    assert_eq!(counter_value(&recorded, engine_metrics::ERRORS_TOTAL, &[]), 1);
}
