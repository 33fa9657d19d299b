//! `amqpframe` broker binary.
//!
//! Runs the protocol server against the in-memory broker until Ctrl+C.

mod cli;

use std::sync::Arc;

use amqpframe::{
    broker::MemoryBroker,
    config::{DispositionMode, EngineConfig},
    sasl::PlainAuthenticator,
    server::AmqpServer,
};
use clap::Parser;
use cli::{Cli, Settle};
use tracing::{info, warn};

fn engine_config(cli: &Cli) -> EngineConfig {
    let mode = match cli.settle {
        Settle::Fifo => DispositionMode::FifoHead,
        Settle::Range => DispositionMode::Range,
    };
    EngineConfig::default()
        .with_container_id(cli.container_id.clone())
        .with_max_frame_size(cli.max_frame_size)
        .with_publish_credit(cli.publish_credit)
        .with_disposition_mode(mode)
}

#[cfg(feature = "metrics")]
fn install_metrics(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(addr) = cli.metrics {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "serving Prometheus metrics");
    }
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.metrics.is_some() {
        warn!("built without the metrics feature; ignoring --metrics");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    install_metrics(&cli)?;

    let broker = cli
        .queues
        .iter()
        .fold(MemoryBroker::new().auto_create(cli.auto_create), |broker, queue| {
            broker.with_queue(queue.clone())
        });

    let (users, invalid) = cli.credentials();
    for entry in invalid {
        warn!(entry, "ignoring --user value without a colon");
    }
    let mut config = engine_config(&cli);
    let mut server = AmqpServer::new(Arc::new(broker));
    if !users.is_empty() {
        let authenticator = users
            .into_iter()
            .fold(PlainAuthenticator::default(), |auth, (user, password)| {
                auth.with_user(user, password)
            });
        server = server.with_authenticator(Arc::new(authenticator));
        config = config.require_sasl(true);
    }
    if let Some(workers) = cli.workers {
        server = server.workers(workers);
    }

    let server = server.with_config(config).bind(cli.bind)?;
    info!(addr = ?server.local_addr(), "listening");
    server.run().await?;
    info!("shut down");
    Ok(())
}
