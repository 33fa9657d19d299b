//! Teardown paths of the connection.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{Connection, ConnectionState};
use crate::{
    codec::Frame,
    error::EngineError,
    performative::{Close, ErrorCondition, condition},
};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Release everything the connection holds.
    ///
    /// Links are detached from the broker, the transport is shut down and
    /// the connection stops counting as active. Safe to call more than once.
    pub async fn on_connection_close(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(connection_id = %self.id, channel = session.channel(), "tearing down session");
            session.end();
        }
        self.state = ConnectionState::Closed;
        self.events_rx.close();
        if let Err(error) = self.framed.get_mut().shutdown().await {
            debug!(connection_id = %self.id, %error, "transport shutdown failed");
        }
        if self.counter.take().is_some() {
            info!(connection_id = %self.id, "connection closed");
        }
    }

    /// Close an open connection because the server is stopping.
    pub(super) fn on_shutdown(&mut self) {
        info!(connection_id = %self.id, "closing connection for server shutdown");
        self.send(Frame::amqp(0, Close {
            error: Some(ErrorCondition::new(
                condition::CONNECTION_FORCED,
                "the server is shutting down",
            )),
        }));
        self.state = ConnectionState::Closed;
    }

    /// Tell the peer why the connection is failing.
    ///
    /// Before `Open` the transport is simply closed, after flushing anything
    /// already queued such as a SASL outcome. Once open, a `Close` carrying
    /// the error condition is sent first.
    pub(super) async fn report(&mut self, error: &EngineError) {
        crate::metrics::inc_errors();
        warn!(connection_id = %self.id, state = %self.state, %error, "connection failed");
        if error.is_reportable() {
            if self.state == ConnectionState::Open {
                self.send(Frame::amqp(0, Close {
                    error: Some(error.condition()),
                }));
            }
            if let Err(flush_error) = self.flush().await {
                debug!(connection_id = %self.id, error = %flush_error, "could not report failure");
            }
        }
        self.state = ConnectionState::Closed;
    }
}
