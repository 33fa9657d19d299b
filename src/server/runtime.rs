//! Runtime control for [`AmqpServer`].

mod accept;
mod backoff;

use std::sync::Arc;

#[cfg(test)]
pub(super) use accept::MockAcceptListener;
pub(super) use accept::{AcceptLoopOptions, accept_loop};
pub use backoff::BackoffConfig;
use futures::Future;
use log::{info, warn};
use tokio::{select, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AmqpServer, Bound, ServerError};
use crate::connection::active_connection_count;

impl AmqpServer<Bound> {
    /// Serve until the process receives Ctrl+C.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use amqpframe::{broker::MemoryBroker, server::AmqpServer};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), amqpframe::server::ServerError> {
    /// let server = AmqpServer::new(Arc::new(MemoryBroker::new().auto_create(true)))
    ///     .bind(([127, 0, 0, 1], 5672).into())?;
    /// server.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Attempting to run a server without binding fails to compile:
    ///
    /// ```compile_fail
    /// use std::sync::Arc;
    ///
    /// use amqpframe::{broker::MemoryBroker, server::AmqpServer};
    ///
    /// async fn try_run() {
    ///     AmqpServer::new(Arc::new(MemoryBroker::new()))
    ///         .run()
    ///         .await
    ///         .expect("unbound servers do not expose run()");
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// Never fails today; accept errors are retried after a pause.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run the server until the `shutdown` future resolves.
    ///
    /// On shutdown the workers stop accepting and every open connection is
    /// sent a `Close` before its transport is shut down. The call returns
    /// once all connection tasks have finished.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use amqpframe::{broker::MemoryBroker, server::AmqpServer};
    /// use tokio::sync::oneshot;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), amqpframe::server::ServerError> {
    /// let server = AmqpServer::new(Arc::new(MemoryBroker::new())).bind(([127, 0, 0, 1], 0).into())?;
    ///
    /// let (tx, rx) = oneshot::channel::<()>();
    /// let handle = tokio::spawn(async move {
    ///     server
    ///         .run_with_shutdown(async {
    ///             let _ = rx.await;
    ///         })
    ///         .await
    /// });
    ///
    /// let _ = tx.send(());
    /// handle
    ///     .await
    ///     .expect("join server task")
    ///     .expect("server run failed");
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Accept failures are retried with exponential back-off and do not
    /// surface as errors.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let AmqpServer {
            context,
            workers,
            ready_tx,
            backoff_config,
            state: Bound { listener },
        } = self;
        let shutdown_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let options = || AcceptLoopOptions {
            shutdown: shutdown_token.clone(),
            tracker: tracker.clone(),
            backoff: backoff_config,
        };
        (0..workers).for_each(|_| {
            tracker.spawn(accept_loop(Arc::clone(&listener), context.clone(), options()));
        });
        info!("accepting connections: workers={workers}, addr={:?}", listener.local_addr().ok());

        if ready_tx.is_some_and(|tx| tx.send(()).is_err()) {
            warn!("readiness receiver dropped before the server started");
        }

        select! {
            () = shutdown => {
                info!(
                    "shutting down: open_connections={}",
                    active_connection_count()
                );
                shutdown_token.cancel();
            }
            () = tracker.wait() => {}
        }

        tracker.close();
        tracker.wait().await;
        info!("all connections closed");
        Ok(())
    }
}
