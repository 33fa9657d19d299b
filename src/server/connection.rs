//! Connection tasks spawned by the accept loop.

use std::{any::Any, fmt, net::SocketAddr};

use futures::FutureExt;
use log::{error, info};
use tokio::net::TcpStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::ConnectionContext;
use crate::connection::Connection;

/// Formats a panic payload, preferring its message when it has one.
struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Spawn a task to run a single TCP connection, logging and discarding any
/// panics.
pub(super) fn spawn_connection_task(
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    context: ConnectionContext,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) {
    if let Err(e) = stream.set_nodelay(true) {
        info!("failed to disable Nagle: error={e}, peer_addr={peer_addr:?}");
    }
    let connection = Connection::new(stream, context.broker, context.config)
        .with_authenticator(context.authenticator)
        .with_shutdown(shutdown);
    let connection_id = connection.id();
    tracker.spawn(async move {
        let fut = std::panic::AssertUnwindSafe(connection.run()).catch_unwind();
        match fut.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                info!("connection ended with error: {connection_id}, error={e}, peer_addr={peer_addr:?}");
            }
            Err(panic) => {
                crate::metrics::inc_connection_panics();
                let panic_msg = PanicMessage(panic);
                // Emit via both `log` and `tracing` for tests that capture either.
                error!("connection task panicked: panic={panic_msg}, peer_addr={peer_addr:?}");
                tracing::error!(panic = %panic_msg, ?peer_addr, "connection task panicked");
            }
        }
    });
}
