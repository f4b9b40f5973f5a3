//! Tunnel listener tests: data path over real loopback TCP plus the mock transport

use autotun_client::{
    Direction, ListenerExit, ListenerSettings, MappingSpec, ProbePolicy, StartError,
    TunnelListener,
};
use autotun_transport::mock::{MockBehavior, MockSession, ProbeBehavior};
use autotun_transport::{Endpoint, TransportSession};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Echo server on an ephemeral loopback port
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn rtl(local: SocketAddr, remote_port: u16) -> MappingSpec {
    MappingSpec::new(
        Endpoint::new(local.ip().to_string(), local.port()),
        Endpoint::new("0.0.0.0", remote_port),
        Direction::RemoteToLocal,
    )
}

fn ltr(remote: &str) -> MappingSpec {
    MappingSpec::new(
        Endpoint::new("127.0.0.1", 0),
        remote.parse().unwrap(),
        Direction::LocalToRemote,
    )
}

fn session() -> Arc<MockSession> {
    Arc::new(MockSession::new(MockBehavior::default()))
}

#[tokio::test]
async fn test_remote_to_local_round_trip() {
    let target = echo_server().await;
    let session = session();
    let token = CancellationToken::new();

    let handle = TunnelListener::start(
        &rtl(target, 9000),
        session.clone(),
        &token,
        &ListenerSettings::default(),
    )
    .await
    .unwrap();
    assert_eq!(handle.description(), "0.0.0.0:9000");

    let mut client = session.connect_to(9000).unwrap();
    client.write_all(b"ping through the tunnel").await.unwrap();

    let mut buf = [0u8; 23];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping through the tunnel");

    // A second connection on the same listener works independently
    let mut second = session.connect_to(9000).unwrap();
    second.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, second.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"again");

    handle.cancel();
    assert_eq!(handle.join().await, ListenerExit::Cancelled);
}

#[tokio::test]
async fn test_local_to_remote_round_trip() {
    let session = session();
    let token = CancellationToken::new();

    let handle = TunnelListener::start(
        &ltr("10.0.0.5:5432"),
        session.clone(),
        &token,
        &ListenerSettings::default(),
    )
    .await
    .unwrap();
    let bound: SocketAddr = handle.description().parse().unwrap();
    assert_ne!(bound.port(), 0);

    let mut client = TcpStream::connect(bound).await.unwrap();
    client.write_all(b"SELECT 1").await.unwrap();

    let (endpoint, mut remote) = timeout(WAIT, session.next_dial()).await.unwrap().unwrap();
    assert_eq!(endpoint, Endpoint::new("10.0.0.5", 5432));

    let mut buf = [0u8; 8];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"SELECT 1");

    remote.write_all(b"1 row").await.unwrap();
    drop(remote);

    let mut reply = Vec::new();
    timeout(WAIT, client.read_to_end(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply, b"1 row");

    // Cancelling the session token stops the listener
    token.cancel();
    assert_eq!(handle.join().await, ListenerExit::Cancelled);
}

#[tokio::test]
async fn test_failed_dial_drops_only_that_connection() {
    let session = Arc::new(MockSession::new(MockBehavior {
        refuse_dials: true,
        ..Default::default()
    }));
    let token = CancellationToken::new();

    let handle = TunnelListener::start(
        &ltr("10.0.0.5:5432"),
        session.clone(),
        &token,
        &ListenerSettings::default(),
    )
    .await
    .unwrap();
    let bound: SocketAddr = handle.description().parse().unwrap();

    let mut client = TcpStream::connect(bound).await.unwrap();
    let mut buf = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut buf)).await.unwrap();
    assert!(read.map(|n| n == 0).unwrap_or(true));

    assert!(!handle.is_finished());
    assert!(!session.is_closed());
    handle.cancel();
}

#[tokio::test]
async fn test_local_bind_conflict() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let spec = MappingSpec::new(
        Endpoint::new("127.0.0.1", port),
        Endpoint::new("10.0.0.5", 5432),
        Direction::LocalToRemote,
    );
    let result = TunnelListener::start(
        &spec,
        session(),
        &CancellationToken::new(),
        &ListenerSettings::default(),
    )
    .await;

    match result {
        Err(StartError::BindFailed { endpoint, .. }) => {
            assert_eq!(endpoint, format!("127.0.0.1:{}", port))
        }
        other => panic!("expected bind failure, got {:?}", other.map(|h| h.description().to_string())),
    }
}

#[tokio::test]
async fn test_remote_bind_rejected() {
    let session = Arc::new(MockSession::new(MockBehavior {
        refused_ports: HashSet::from([9000]),
        ..Default::default()
    }));
    let target = echo_server().await;

    let result = TunnelListener::start(
        &rtl(target, 9000),
        session.clone(),
        &CancellationToken::new(),
        &ListenerSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(StartError::BindFailed { .. })));
}

#[tokio::test]
async fn test_strict_probe_reports_occupied() {
    let session = session();
    session.set_probe(ProbeBehavior::Match);
    let settings = ListenerSettings {
        probe_policy: ProbePolicy::Strict,
        ..Default::default()
    };
    let target = echo_server().await;

    let result = TunnelListener::start(
        &rtl(target, 9000),
        session.clone(),
        &CancellationToken::new(),
        &settings,
    )
    .await;
    assert!(matches!(result, Err(StartError::PortOccupied { .. })));
    assert!(session.listen_calls().is_empty());
}

#[tokio::test]
async fn test_probe_failure_surfaces() {
    let session = session();
    session.set_probe(ProbeBehavior::ExecError);
    let target = echo_server().await;

    let result = TunnelListener::start(
        &rtl(target, 9000),
        session.clone(),
        &CancellationToken::new(),
        &ListenerSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(StartError::Probe(_))));
}

#[tokio::test]
async fn test_session_drop_while_starting_reports_session_closed() {
    let session = session();
    session.set_probe(ProbeBehavior::DropSession);
    let target = echo_server().await;

    let result = TunnelListener::start(
        &rtl(target, 9000),
        session.clone(),
        &CancellationToken::new(),
        &ListenerSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(StartError::SessionClosed)));
    assert!(session.is_closed());
    assert!(session.listen_calls().is_empty());
}

#[tokio::test]
async fn test_listen_on_closed_session() {
    let session = session();
    session.drop_connection();
    let target = echo_server().await;

    let result = TunnelListener::start(
        &rtl(target, 0),
        session.clone(),
        &CancellationToken::new(),
        &ListenerSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(StartError::SessionClosed)));
}

#[tokio::test]
async fn test_threshold_closes_session_and_other_listeners_exit() {
    let target = echo_server().await;
    let session = session();
    let token = CancellationToken::new();
    let settings = ListenerSettings::default();

    let failing = TunnelListener::start(&rtl(target, 9000), session.clone(), &token, &settings)
        .await
        .unwrap();
    let bystander = TunnelListener::start(&rtl(target, 9001), session.clone(), &token, &settings)
        .await
        .unwrap();

    session.fail_accepts(9000, 11).unwrap();

    let exit = timeout(WAIT, failing.join()).await.unwrap();
    assert_eq!(exit, ListenerExit::ThresholdExceeded);
    assert!(session.is_closed());
    assert!(token.is_cancelled());
    assert_eq!(
        session.close_reasons(),
        vec!["accept failure threshold exceeded".to_string()]
    );

    let exit = timeout(WAIT, bystander.join()).await.unwrap();
    assert!(matches!(
        exit,
        ListenerExit::Cancelled | ListenerExit::SessionClosed
    ));
}

#[tokio::test]
async fn test_failures_below_threshold_are_tolerated() {
    let target = echo_server().await;
    let session = session();
    let token = CancellationToken::new();

    let handle = TunnelListener::start(
        &rtl(target, 9000),
        session.clone(),
        &token,
        &ListenerSettings::default(),
    )
    .await
    .unwrap();

    session.fail_accepts(9000, 10).unwrap();

    // A successful accept after the failures still forwards
    let mut client = session.connect_to(9000).unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ok");

    // The counter was reset, so ten more are fine as well
    session.fail_accepts(9000, 10).unwrap();
    let mut client = session.connect_to(9000).unwrap();
    client.write_all(b"ok").await.unwrap();
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();

    assert!(!session.is_closed());
    assert!(!handle.is_finished());
    handle.cancel();
}

#[tokio::test]
async fn test_session_drop_ends_remote_listener() {
    let target = echo_server().await;
    let session = session();
    let token = CancellationToken::new();

    let handle = TunnelListener::start(
        &rtl(target, 9000),
        session.clone(),
        &token,
        &ListenerSettings::default(),
    )
    .await
    .unwrap();

    session.drop_connection();
    let exit = timeout(WAIT, handle.join()).await.unwrap();
    assert_eq!(exit, ListenerExit::SessionClosed);
}
