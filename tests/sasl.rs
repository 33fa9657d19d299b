//! SASL negotiation through the TCP server.

mod common;

use std::sync::Arc;

use amqpframe::{
    EngineConfig,
    broker::MemoryBroker,
    header::ProtocolHeader,
    performative::{SaslCode, SaslFrame, SaslInit},
    sasl::{ANONYMOUS, PLAIN, PlainAuthenticator},
};
use amqpframe_testing::TestResult;
use common::{Client, RunningServer};
use rstest::rstest;

async fn plain_server(require_sasl: bool) -> TestResult<RunningServer> {
    let authenticator = PlainAuthenticator::default().with_user("guest", "secret");
    RunningServer::start(
        Arc::new(MemoryBroker::new().auto_create(true)),
        Some(Arc::new(authenticator)),
        EngineConfig::default().require_sasl(require_sasl),
    )
    .await
}

async fn negotiate(client: &mut Client, mechanism: &str, response: &[u8]) -> TestResult<SaslCode> {
    client.send_header(ProtocolHeader::SASL).await?;
    assert_eq!(client.recv_header().await?, ProtocolHeader::SASL);
    match client.recv_sasl().await? {
        SaslFrame::Mechanisms(offer) => assert_eq!(offer.mechanisms, [PLAIN]),
        other => return Err(format!("expected mechanisms, got {other:?}").into()),
    }
    client
        .send(amqpframe::codec::Frame::sasl(SaslFrame::Init(SaslInit {
            mechanism: mechanism.to_owned(),
            initial_response: Some(response.to_vec()),
            hostname: None,
        })))
        .await?;
    match client.recv_sasl().await? {
        SaslFrame::Outcome(outcome) => Ok(outcome.code),
        other => Err(format!("expected outcome, got {other:?}").into()),
    }
}

#[tokio::test]
async fn authenticated_peer_continues_with_plain_layer() -> TestResult {
    let server = plain_server(true).await?;
    let mut client = Client::connect(server.addr).await?;

    assert_eq!(negotiate(&mut client, PLAIN, b"\0guest\0secret").await?, SaslCode::Ok);
    client.expect_header();
    client.send_header(ProtocolHeader::AMQP).await?;
    assert_eq!(client.recv_header().await?, ProtocolHeader::AMQP);
    client.open_and_begin().await?;

    server.stop().await
}

#[rstest]
#[case::wrong_password(PLAIN, &b"\0guest\0nope"[..])]
#[case::unknown_user(PLAIN, &b"\0root\0secret"[..])]
#[case::unoffered_mechanism(ANONYMOUS, &b""[..])]
#[tokio::test]
async fn refused_peer_is_disconnected(#[case] mechanism: &str, #[case] response: &[u8]) -> TestResult {
    let server = plain_server(false).await?;
    let mut client = Client::connect(server.addr).await?;

    assert_eq!(negotiate(&mut client, mechanism, response).await?, SaslCode::Auth);
    assert!(client.recv().await?.is_none(), "connection should be closed");

    server.stop().await
}

#[tokio::test]
async fn plain_layer_is_refused_when_sasl_is_required() -> TestResult {
    let server = plain_server(true).await?;
    let mut client = Client::connect(server.addr).await?;

    client.send_header(ProtocolHeader::AMQP).await?;
    assert!(client.recv().await?.is_none(), "no header echo expected");

    server.stop().await
}

#[tokio::test]
async fn plain_layer_is_allowed_when_sasl_is_optional() -> TestResult {
    let server = plain_server(false).await?;
    let mut client = Client::connect(server.addr).await?;
    client.handshake().await?;
    server.stop().await
}
