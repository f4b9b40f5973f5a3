//! Configuration file to running supervisor, over the in-memory transport

use autotun_cli::config::AppConfig;
use autotun_client::{Direction, Supervisor, SupervisorState};
use autotun_transport::mock::MockConnector;
use autotun_transport::{AuthMethod, Endpoint};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

const CONFIG: &str = r#"
server:
  addr: tunnel.example.com
  user: tunnel
  password: secret
  keyfile: id_ed25519
mappings:
  rtl:
    - "127.0.0.1:22,0.0.0.0:2222"
    - "127.0.0.1:80"
  ltr:
    - "127.0.0.1:0,db.internal:5432"
"#;

fn write_config(dir: &TempDir, name: &str, content: &str) {
    std::fs::write(dir.path().join(name), content).unwrap();
}

#[test]
fn test_discovered_config_builds_plan() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "config.yaml", CONFIG);

    let (path, config) = AppConfig::resolve(None, dir.path()).unwrap();
    assert_eq!(path, dir.path().join("config.yaml"));

    let ssh = config.ssh_config().unwrap();
    assert_eq!(ssh.addr, Endpoint::new("tunnel.example.com", 22));

    // The single-address pair is dropped, the order stays RTL then LTR
    let mappings = config.mappings();
    assert_eq!(mappings.len(), 2);
    assert_eq!(mappings[0].direction, Direction::RemoteToLocal);
    assert_eq!(mappings[0].listen_endpoint(), &Endpoint::new("0.0.0.0", 2222));
    assert_eq!(mappings[1].direction, Direction::LocalToRemote);
    assert_eq!(mappings[1].target_endpoint(), &Endpoint::new("db.internal", 5432));
}

#[test]
fn test_missing_config_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(AppConfig::resolve(None, dir.path()).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_config_drives_supervisor() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "config.private.yaml", CONFIG);
    write_config(&dir, "id_ed25519", "placeholder key material");

    let (_, config) = AppConfig::resolve(None, dir.path()).unwrap();

    let connector = MockConnector::new();
    let supervisor = Supervisor::new(
        connector.clone(),
        config.mappings(),
        config.credentials(dir.path()),
        config.supervisor_config(),
    );
    let handle = supervisor.handle();
    let task = tokio::spawn(supervisor.run());

    let mut registry = handle.subscribe_registry();
    timeout(
        Duration::from_secs(60),
        registry.wait_for(|snapshot| snapshot.is_fully_forwarded() && snapshot.passes > 0),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        connector.auth_seen()[0],
        vec![
            AuthMethod::PrivateKey(dir.path().join("id_ed25519")),
            AuthMethod::Password("secret".to_string()),
        ]
    );
    let session = connector.last_session().unwrap();
    assert_eq!(session.listen_calls(), vec![Endpoint::new("0.0.0.0", 2222)]);

    handle.stop();
    timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
    assert_eq!(handle.state(), SupervisorState::Stopped);
}
