//! Errors raised while preparing an [`AmqpServer`](super::AmqpServer).

use std::io;

use thiserror::Error;

/// Failure to start serving.
///
/// Once the server runs, accept failures are retried and connection
/// failures stay inside their own task, so neither is reported here.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound or configured.
    #[error("cannot listen: {0}")]
    Bind(#[source] io::Error),
}
