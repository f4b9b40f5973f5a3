//! Tests for transport abstraction layer

use super::mock::*;
use super::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_tcp_listener_accept() {
    let mut listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    assert_eq!(listener.local_description(), addr.to_string());

    let client = tokio::spawn(async move {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream
    });

    let (mut accepted, peer) = StreamListener::accept(&mut listener).await.unwrap();
    assert!(peer.starts_with("127.0.0.1:"));

    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    drop(client.await.unwrap());
}

#[test]
fn test_auth_method_debug_redacts_password() {
    let method = AuthMethod::Password("hunter2".to_string());
    let printed = format!("{:?}", method);
    assert!(!printed.contains("hunter2"));
    assert!(printed.contains("redacted"));

    let key = AuthMethod::PrivateKey(PathBuf::from("/home/user/.ssh/id_ed25519"));
    assert!(format!("{:?}", key).contains("id_ed25519"));
}

#[test]
fn test_exec_output_lossy() {
    let output = ExecOutput {
        exit_status: Some(0),
        output: b"tcp 0.0.0.0:22 LISTEN\n".to_vec(),
    };
    assert_eq!(output.output_lossy(), "tcp 0.0.0.0:22 LISTEN\n");
}

#[tokio::test]
async fn test_mock_connector_script() {
    let connector = MockConnector::new();
    connector.script([
        ConnectOutcome::Fail("network unreachable".to_string()),
        ConnectOutcome::RejectAuth,
    ]);
    let auth = vec![AuthMethod::Password("secret".to_string())];

    assert!(matches!(
        connector.connect(&auth).await,
        Err(TransportError::ConnectionError(_))
    ));
    assert!(matches!(
        connector.connect(&auth).await,
        Err(TransportError::AuthenticationFailed(_))
    ));
    let session = connector.connect(&auth).await.unwrap();

    assert_eq!(connector.attempts(), 3);
    assert_eq!(connector.sessions().len(), 1);
    assert_eq!(connector.auth_seen()[2], auth);
    assert!(session.session_id().starts_with("mock-"));
}

#[tokio::test]
async fn test_mock_remote_listener_delivers_connections() {
    let session = MockSession::new(MockBehavior::default());
    let mut listener = session
        .listen_remote(&Endpoint::new("0.0.0.0", 9000))
        .await
        .unwrap();
    assert!(session.is_listening(9000));
    assert_eq!(listener.local_description(), "0.0.0.0:9000");

    let mut client = session.connect_to(9000).unwrap();
    let (mut server, peer) = listener.accept().await.unwrap();
    assert!(peer.starts_with("203.0.113.1:"));

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_mock_injected_accept_failures() {
    let session = MockSession::new(MockBehavior::default());
    let mut listener = session
        .listen_remote(&Endpoint::new("0.0.0.0", 9001))
        .await
        .unwrap();

    session.fail_accepts(9001, 2).unwrap();
    assert!(matches!(
        listener.accept().await,
        Err(TransportError::ChannelError(_))
    ));
    assert!(matches!(
        listener.accept().await,
        Err(TransportError::ChannelError(_))
    ));
}

#[tokio::test]
async fn test_mock_refused_port() {
    let session = MockSession::new(MockBehavior::default());
    session.set_port_refused(9002, true);

    let result = session.listen_remote(&Endpoint::new("0.0.0.0", 9002)).await;
    assert!(matches!(result, Err(TransportError::BindRejected { .. })));
    assert_eq!(session.listen_calls().len(), 1);
    assert!(!session.is_listening(9002));
}

#[tokio::test]
async fn test_mock_dial_remote() {
    let session = MockSession::new(MockBehavior::default());
    let target = Endpoint::new("127.0.0.1", 5432);

    let mut local = session.dial_remote(&target).await.unwrap();
    let (endpoint, mut remote) = session.next_dial().await.unwrap();
    assert_eq!(endpoint, target);

    local.write_all(b"query").await.unwrap();
    let mut buf = [0u8; 5];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"query");
}

#[tokio::test]
async fn test_mock_probe_behaviors() {
    let session = MockSession::new(MockBehavior::default());

    let output = session.exec("netstat -ltn").await.unwrap();
    assert_eq!(output.exit_status, Some(1));

    session.set_probe(ProbeBehavior::Match);
    assert_eq!(session.exec("netstat -ltn").await.unwrap().exit_status, Some(0));

    session.set_probe(ProbeBehavior::ExitStatus(127));
    assert_eq!(
        session.exec("netstat -ltn").await.unwrap().exit_status,
        Some(127)
    );

    session.set_probe(ProbeBehavior::ExecError);
    assert!(matches!(
        session.exec("netstat -ltn").await,
        Err(TransportError::ExecFailed(_))
    ));

    assert_eq!(session.exec_calls().len(), 4);
}

#[tokio::test]
async fn test_mock_drop_during_exec() {
    let session = MockSession::new(MockBehavior {
        probe: ProbeBehavior::DropSession,
        ..Default::default()
    });

    assert!(matches!(
        session.exec("netstat -ltn").await,
        Err(TransportError::SessionClosed)
    ));
    assert!(session.is_closed());
    assert_eq!(session.close_reasons(), vec!["connection lost".to_string()]);
}

#[tokio::test]
async fn test_mock_close_ends_listeners() {
    let session = MockSession::new(MockBehavior::default());
    let mut listener = session
        .listen_remote(&Endpoint::new("0.0.0.0", 9003))
        .await
        .unwrap();
    assert!(!session.is_closed());

    session.close("test over").await;
    session.close("second close is a no-op").await;

    assert!(session.is_closed());
    session.closed().await;
    assert_eq!(session.close_reasons(), vec!["test over".to_string()]);
    assert!(matches!(
        listener.accept().await,
        Err(TransportError::SessionClosed)
    ));
    assert!(matches!(
        session.dial_remote(&Endpoint::new("127.0.0.1", 1)).await,
        Err(TransportError::SessionClosed)
    ));
}

#[tokio::test]
async fn test_mock_drop_connection() {
    let session = MockSession::new(MockBehavior::default());
    let observer = session.clone();

    let waiter = tokio::spawn(async move { observer.closed().await });
    session.drop_connection();

    waiter.await.unwrap();
    assert!(session.is_closed());
    assert_eq!(session.close_reasons(), vec!["connection lost".to_string()]);
}
