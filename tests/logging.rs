//! Log output of the engine, captured through the `log` bridge.

use std::sync::Arc;

use amqpframe::EngineConfig;
use amqpframe_testing::{LoggerHandle, RecordingBroker, drive_connection, logger};
use rstest::rstest;

#[rstest]
#[tokio::test]
async fn failed_connections_are_logged(mut logger: LoggerHandle) {
    drive_connection(
        Arc::new(RecordingBroker::new()),
        EngineConfig::default(),
        vec![b"AMQX\x00\x01\x00\x00".to_vec()],
    )
    .await
    .expect("drive connection");
    assert!(logger.contains("connection failed"));
}
