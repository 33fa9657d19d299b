//! Accept workers feeding sockets to connection tasks.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{Duration, sleep},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::backoff::BackoffConfig;
use crate::server::{ConnectionContext, connection::spawn_connection_task};

/// Source of inbound sockets.
///
/// Dropping a pending `accept()` future must not lose a connection.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> { TcpListener::accept(self).await }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

#[derive(Debug)]
pub(in crate::server) struct AcceptLoopOptions {
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: BackoffConfig,
}

/// What one pass of the worker decided.
enum Step {
    Accepted,
    Failed,
    Stop,
}

struct AcceptWorker<L> {
    listener: Arc<L>,
    context: ConnectionContext,
    options: AcceptLoopOptions,
}

impl<L> AcceptWorker<L>
where
    L: AcceptListener + 'static,
{
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn step(&self) -> Step {
        let accepted = select! {
            biased;

            () = self.options.shutdown.cancelled() => return Step::Stop,
            res = self.listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("accepted connection: peer_addr={peer_addr}");
                spawn_connection_task(
                    stream,
                    Some(peer_addr),
                    self.context.clone(),
                    self.options.shutdown.clone(),
                    &self.options.tracker,
                );
                Step::Accepted
            }
            Err(e) => {
                let local_addr = self.listener.local_addr().ok();
                warn!("accept failed: error={e}, local_addr={local_addr:?}");
                Step::Failed
            }
        }
    }

    async fn pause(&self, delay: Duration) -> bool {
        select! {
            biased;

            () = self.options.shutdown.cancelled() => false,
            () = sleep(delay) => true,
        }
    }

    async fn run(self) {
        let backoff = self.options.backoff;
        let mut delay = backoff.initial_delay;
        loop {
            match self.step().await {
                Step::Accepted => delay = backoff.initial_delay,
                Step::Failed => {
                    if !self.pause(delay).await {
                        break;
                    }
                    delay = backoff.after(delay);
                }
                Step::Stop => break,
            }
        }
    }
}

/// Accept sockets until `options.shutdown` fires, spawning a tracked
/// connection task for each one.
///
/// Accept errors pause the worker according to `options.backoff`.
pub(in crate::server) async fn accept_loop<L>(
    listener: Arc<L>,
    context: ConnectionContext,
    mut options: AcceptLoopOptions,
) where
    L: AcceptListener + 'static,
{
    options.backoff = options.backoff.normalized();
    AcceptWorker {
        listener,
        context,
        options,
    }
    .run()
    .await;
}
