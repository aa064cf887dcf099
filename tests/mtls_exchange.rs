#![allow(clippy::unwrap_used)]

mod common;

use common::{Ca, RunningServer, CLIENT_ID, HANDSHAKE_TIMEOUT, SERVER_ID};
use hyper::StatusCode;
use spiffe_mtls_demo::config::ClientSettings;
use spiffe_mtls_demo::{policy, runner, Error};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn timestamp_of(body: &str) -> OffsetDateTime {
    let stamp = body
        .rsplit_once("The current time is ")
        .map(|(_, rest)| rest.trim_end_matches('.'))
        .unwrap();
    OffsetDateTime::parse(stamp, &Rfc3339).unwrap()
}

#[tokio::test]
async fn greeting_names_the_authenticated_client() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(ca.document(SERVER_ID), policy::allow_any()).await;
    let (client, _agent) = common::source(ca.document(CLIENT_ID)).await;

    let greeting = runner::fetch_greeting(&client, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(greeting.status, StatusCode::OK);
    assert_eq!(greeting.server.uri(), Some(SERVER_ID));
    assert!(greeting
        .body
        .starts_with("Hello, spiffe://example.org/client! The current time is "));
    let sent_at = timestamp_of(&greeting.body);
    assert!((OffsetDateTime::now_utc() - sent_at).abs() < time::Duration::minutes(1));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn any_verified_client_is_greeted() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(ca.document(SERVER_ID), policy::allow_any()).await;

    for id in ["spiffe://example.org/web", "spiffe://example.org/batch/job-7"] {
        let (client, _agent) = common::source(ca.document(id)).await;
        let greeting =
            runner::fetch_greeting(&client, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
                .await
                .unwrap();
        assert!(greeting.body.contains(id), "body: {}", greeting.body);
        client.close().await;
    }

    server.stop().await;
}

#[tokio::test]
async fn client_rejects_unexpected_server_identity() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(
        ca.document("spiffe://example.org/impostor"),
        policy::allow_any(),
    )
    .await;
    let (client, _agent) = common::source(ca.document(CLIENT_ID)).await;

    let err = runner::fetch_greeting(&client, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized(), "unexpected error: {err}");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn untrusted_server_fails_before_any_response() {
    let ours = Ca::new("example.org");
    let theirs = Ca::new("example.org");
    let server = RunningServer::start(theirs.document(SERVER_ID), policy::allow_any()).await;
    let (client, _agent) = common::source(ours.document(CLIENT_ID)).await;

    let err = runner::fetch_greeting(&client, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handshake(_)), "unexpected error: {err}");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn allow_list_turns_away_unlisted_client() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(
        ca.document(SERVER_ID),
        policy::allow_list(["spiffe://example.org/admin"]).unwrap(),
    )
    .await;

    let (listed, _a) = common::source(ca.document("spiffe://example.org/admin")).await;
    let greeting = runner::fetch_greeting(&listed, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(greeting.status, StatusCode::OK);

    let (unlisted, _b) = common::source(ca.document(CLIENT_ID)).await;
    let result =
        runner::fetch_greeting(&unlisted, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT).await;
    assert!(result.is_err(), "unlisted client got {result:?}");

    listed.close().await;
    unlisted.close().await;
    server.stop().await;
}

#[tokio::test]
async fn rotated_client_identity_is_used_for_new_connections() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(ca.document(SERVER_ID), policy::allow_any()).await;
    let (client, agent) = common::source(ca.document(CLIENT_ID)).await;

    let before = runner::fetch_greeting(&client, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    assert!(before.body.contains(CLIENT_ID));

    let mut updates = client.updated();
    agent.publish(ca.document("spiffe://example.org/client-v2"));
    updates.wait_for(|generation| generation >= 2).await.unwrap();

    let after = runner::fetch_greeting(&client, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    assert!(after.body.contains("spiffe://example.org/client-v2"), "body: {}", after.body);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn rotated_server_identity_is_presented_to_new_clients() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(ca.document(SERVER_ID), policy::allow_any()).await;
    let (client, _agent) = common::source(ca.document(CLIENT_ID)).await;

    let next_id = "spiffe://example.org/server-v2";
    server.agent.publish(ca.document(next_id));

    // The server's TLS material follows the source asynchronously.
    let mut presented = None;
    for _ in 0..50 {
        let greeting = runner::fetch_greeting(&client, &server.address(), next_id, HANDSHAKE_TIMEOUT).await;
        match greeting {
            Ok(greeting) => {
                presented = greeting.server.uri().map(str::to_owned);
                break;
            }
            Err(e) if e.is_unauthorized() => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(presented.as_deref(), Some(next_id));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn client_without_agent_fails_before_dialing() {
    let settings = ClientSettings {
        socket: "unix:///nonexistent/spiffe-mtls-demo/agent.sock".into(),
        ready_timeout: Duration::from_secs(2),
        ..ClientSettings::default()
    };

    let err = runner::run_client(settings).await.unwrap_err();
    assert!(matches!(err, Error::Identity(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn server_stops_on_shutdown() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(ca.document(SERVER_ID), policy::allow_any()).await;
    let addr = server.addr;

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .unwrap();
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn failed_connections_do_not_affect_later_clients() {
    let ca = Ca::new("example.org");
    let server = RunningServer::start(ca.document(SERVER_ID), policy::allow_any()).await;
    let (good, _good_agent) = common::source(ca.document(CLIENT_ID)).await;

    // A peer that connects and never starts the handshake.
    let stalled = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let greeting = runner::fetch_greeting(&good, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(greeting.status, StatusCode::OK);

    // A client that trusts the server but holds a certificate the server
    // cannot verify.
    let rogue_ca = Ca::new("example.org");
    let (rogue, _rogue_agent) =
        common::source(rogue_ca.document_trusting(CLIENT_ID, &ca)).await;
    let rejected =
        runner::fetch_greeting(&rogue, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT).await;
    assert!(rejected.is_err(), "rogue client got {rejected:?}");

    let greeting = runner::fetch_greeting(&good, &server.address(), SERVER_ID, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(greeting.status, StatusCode::OK);
    assert!(greeting.body.contains(CLIENT_ID));

    drop(stalled);
    good.close().await;
    rogue.close().await;
    server.stop().await;
}
