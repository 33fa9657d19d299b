//! End-to-end publish and consume over TCP against the in-memory broker.

mod common;

use std::sync::Arc;

use amqpframe::{
    EngineConfig,
    broker::MemoryBroker,
    performative::{
        Close,
        DeliveryState,
        Detach,
        Disposition,
        Flow,
        Performative,
        Role,
        Transfer,
        condition,
    },
};
use amqpframe_testing::TestResult;
use common::{Client, RunningServer};
use rstest::rstest;

fn transfer(delivery_id: u32, settled: bool) -> Transfer {
    Transfer {
        handle: 0,
        delivery_id: Some(delivery_id),
        delivery_tag: Some(delivery_id.to_be_bytes().to_vec()),
        settled,
        more: false,
    }
}

fn grant(credit: u32) -> Flow {
    Flow {
        next_incoming_id: Some(1),
        incoming_window: 2048,
        next_outgoing_id: 0,
        outgoing_window: 2048,
        handle: Some(0),
        delivery_count: Some(0),
        link_credit: Some(credit),
        drain: false,
        echo: false,
    }
}

async fn publisher(addr: std::net::SocketAddr, address: &str) -> TestResult<Client> {
    let mut client = Client::connect(addr).await?;
    client.handshake().await?;
    match client.attach(0, Role::Sender, address).await? {
        Performative::Attach(attach) => assert_eq!(attach.role, Role::Receiver),
        other => return Err(format!("expected attach, got {other:?}").into()),
    }
    match client.recv_performative().await? {
        Performative::Flow(flow) => assert!(flow.link_credit.is_some_and(|c| c > 0)),
        other => return Err(format!("expected credit, got {other:?}").into()),
    }
    Ok(client)
}

async fn subscriber(addr: std::net::SocketAddr, address: &str, credit: u32) -> TestResult<Client> {
    let mut client = Client::connect(addr).await?;
    client.handshake().await?;
    match client.attach(0, Role::Receiver, address).await? {
        Performative::Attach(attach) => assert_eq!(attach.role, Role::Sender),
        other => return Err(format!("expected attach, got {other:?}").into()),
    }
    client.send_performative(grant(credit)).await?;
    Ok(client)
}

#[tokio::test]
async fn published_message_reaches_subscriber() -> TestResult {
    let broker = Arc::new(MemoryBroker::new().with_queue("queue/a"));
    let server = RunningServer::start(broker.clone(), None, EngineConfig::default()).await?;

    let mut producer = publisher(server.addr, "queue/a").await?;
    producer.send_transfer(transfer(0, false), b"hello").await?;
    match producer.recv_performative().await? {
        Performative::Disposition(disposition) => {
            assert_eq!(disposition.first, 0);
            assert!(disposition.settled);
            assert_eq!(disposition.state, Some(DeliveryState::Accepted));
        }
        other => return Err(format!("expected disposition, got {other:?}").into()),
    }

    let mut consumer = subscriber(server.addr, "queue/a", 10).await?;
    let (performative, payload) = consumer.recv_with_payload().await?;
    let Performative::Transfer(delivered) = performative else {
        return Err(format!("expected transfer, got {performative:?}").into());
    };
    assert_eq!(delivered.delivery_id, Some(1));
    assert_eq!(payload.as_ref(), b"hello");

    consumer
        .send_performative(Disposition {
            role: Role::Receiver,
            first: 1,
            last: None,
            settled: true,
            state: Some(DeliveryState::Accepted),
        })
        .await?;
    consumer.send_performative(Close::default()).await?;
    assert!(matches!(consumer.recv_performative().await?, Performative::Close(_)));
    assert_eq!(broker.ready_count("queue/a"), 0);

    server.stop().await
}

#[rstest]
#[case(3, 3)]
#[case(5, 2)]
#[tokio::test]
async fn subscriber_never_exceeds_credit(#[case] published: u32, #[case] credit: u32) -> TestResult {
    let broker = Arc::new(MemoryBroker::new().with_queue("queue/credit"));
    let server = RunningServer::start(broker.clone(), None, EngineConfig::default()).await?;

    let mut producer = publisher(server.addr, "queue/credit").await?;
    for id in 0..published {
        producer.send_transfer(transfer(id, true), b"m").await?;
    }
    // Settled transfers get no disposition; round-trip a flow echo to know
    // the publisher link has seen them all.
    producer
        .send_performative(Flow {
            handle: None,
            echo: true,
            ..grant(0)
        })
        .await?;
    assert!(matches!(producer.recv_performative().await?, Performative::Flow(_)));

    let mut consumer = subscriber(server.addr, "queue/credit", credit).await?;
    for expected in 1..=credit {
        let (performative, _) = consumer.recv_with_payload().await?;
        let Performative::Transfer(delivered) = performative else {
            return Err(format!("expected transfer, got {performative:?}").into());
        };
        assert_eq!(delivered.delivery_id, Some(expected));
    }
    consumer
        .send_performative(Flow {
            echo: true,
            ..grant(credit)
        })
        .await?;
    match consumer.recv_performative().await? {
        Performative::Flow(flow) => assert_eq!(flow.link_credit, Some(0)),
        other => return Err(format!("expected flow echo, got {other:?}").into()),
    }
    assert_eq!(broker.ready_count("queue/credit"), (published - credit) as usize);

    server.stop().await
}

#[tokio::test]
async fn attach_to_unknown_queue_is_refused_with_detach() -> TestResult {
    let broker = Arc::new(MemoryBroker::new());
    let server = RunningServer::start(broker, None, EngineConfig::default()).await?;

    let mut client = Client::connect(server.addr).await?;
    client.handshake().await?;
    match client.attach(0, Role::Receiver, "queue/none").await? {
        Performative::Attach(attach) => assert!(attach.source.is_none()),
        other => return Err(format!("expected attach, got {other:?}").into()),
    }
    match client.recv_performative().await? {
        Performative::Detach(Detach { closed, error, .. }) => {
            assert!(closed);
            assert_eq!(error.map(|e| e.condition).as_deref(), Some(condition::NOT_FOUND));
        }
        other => return Err(format!("expected detach, got {other:?}").into()),
    }

    server.stop().await
}

#[tokio::test]
async fn unsettled_messages_return_to_queue_when_subscriber_leaves() -> TestResult {
    let broker = Arc::new(MemoryBroker::new().with_queue("queue/r"));
    let server = RunningServer::start(broker.clone(), None, EngineConfig::default()).await?;

    let mut producer = publisher(server.addr, "queue/r").await?;
    producer.send_transfer(transfer(0, false), b"again").await?;
    assert!(matches!(producer.recv_performative().await?, Performative::Disposition(_)));

    let mut first = subscriber(server.addr, "queue/r", 1).await?;
    assert!(matches!(first.recv_performative().await?, Performative::Transfer(_)));
    first.send_performative(Close::default()).await?;
    assert!(matches!(first.recv_performative().await?, Performative::Close(_)));

    let mut second = subscriber(server.addr, "queue/r", 1).await?;
    let (performative, payload) = second.recv_with_payload().await?;
    assert!(matches!(performative, Performative::Transfer(_)));
    assert_eq!(payload.as_ref(), b"again");

    server.stop().await
}
