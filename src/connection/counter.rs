//! Process-wide count of running connections.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::ConnectionId;

static RUNNING: AtomicU64 = AtomicU64::new(0);

/// Counts its connection as running until dropped, which also covers a
/// task that unwinds before
/// [`on_connection_close`](super::Connection::on_connection_close).
#[derive(Debug)]
pub(super) struct ActiveConnection(ConnectionId);

impl ActiveConnection {
    pub(super) fn register(id: ConnectionId) -> Self {
        let running = RUNNING.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::inc_connections();
        debug!(connection_id = %id, running, "connection started");
        Self(id)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let running = RUNNING.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::dec_connections();
        debug!(connection_id = %self.0, running, "connection released");
    }
}

/// Number of connections currently running in this process.
#[must_use]
pub fn active_connection_count() -> u64 { RUNNING.load(Ordering::Relaxed) }
