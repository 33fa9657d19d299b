//! Utilities for driving an [`amqpframe`] connection during tests.
//!
//! The helpers run a [`Connection`](amqpframe::connection::Connection) on a
//! `tokio::io::duplex` stream, feed it encoded protocol units and return the
//! bytes it wrote back.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use amqpframe::{EngineConfig, header::ProtocolHeader, test_helpers::RecordingBroker};
//! use amqpframe_testing::drive_connection;
//!
//! # async fn example() -> std::io::Result<()> {
//! let broker = Arc::new(RecordingBroker::new());
//! let output = drive_connection(broker, EngineConfig::default(), vec![
//!     ProtocolHeader::AMQP.to_bytes().to_vec(),
//! ])
//! .await?;
//! assert_eq!(output, ProtocolHeader::AMQP.to_bytes());
//! # Ok(())
//! # }
//! ```

pub mod drive;
pub mod logging;
pub mod metrics;

pub use amqpframe::test_helpers::{
    Published,
    RecordingBroker,
    TestPeer,
    attach_frame,
    begin_frame,
    open_frame,
};
pub use drive::{decode_all, drive_connection, encode_units};
pub use logging::{LoggerHandle, logger};
pub use metrics::{Recorded, counter_value, gauge_value, with_recorder};

/// Result type used by test helpers that may fail with any error.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
