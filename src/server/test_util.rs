//! Fixtures for server unit tests.

use std::{
    net::{Ipv4Addr, TcpListener as StdTcpListener},
    sync::Arc,
};

use rstest::fixture;

use super::{AmqpServer, Bound};
use crate::broker::{Broker, MemoryBroker};

/// Broker that creates any queue a peer attaches to.
#[fixture]
pub fn broker() -> Arc<dyn Broker> { Arc::new(MemoryBroker::new().auto_create(true)) }

/// Listener already bound to an ephemeral loopback port, so no other
/// process can take the port before the server adopts it.
#[fixture]
pub fn free_listener() -> StdTcpListener {
    StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind ephemeral port")
}

pub fn bind_server(broker: Arc<dyn Broker>, listener: StdTcpListener) -> AmqpServer<Bound> {
    AmqpServer::new(broker)
        .bind_existing_listener(listener)
        .expect("adopt listener")
}
