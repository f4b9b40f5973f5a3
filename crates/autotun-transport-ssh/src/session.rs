//! SSH connector and session

use crate::config::SshConfig;
use crate::handler::{ForwardTable, SshHandler};
use crate::listener::SshRemoteListener;
use crate::ssh_error;
use async_trait::async_trait;
use autotun_transport::{
    AuthMethod, BoxedStream, Endpoint, ExecOutput, TransportConnector, TransportError,
    TransportResult, TransportSession,
};
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type SharedHandle = Arc<Mutex<client::Handle<SshHandler>>>;

/// Opens authenticated SSH sessions to one server
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, auth: &[AuthMethod]) -> TransportResult<Self::Session> {
        if auth.is_empty() {
            return Err(TransportError::ConfigurationError(
                "no authentication methods configured".to_string(),
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let forwards = ForwardTable::new();
        let closed = CancellationToken::new();
        let handler = SshHandler {
            session_id: session_id.clone(),
            forwards: forwards.clone(),
            closed: closed.clone(),
        };

        debug!(
            session_id = %session_id,
            addr = %self.config.addr,
            user = %self.config.user,
            "Connecting to SSH server"
        );

        let addr = (self.config.addr.host.as_str(), self.config.addr.port);
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(Arc::new(self.config.russh_config()), addr, handler),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| ssh_error("SSH connection failed", e))?;

        for method in auth {
            let accepted = match method {
                AuthMethod::PrivateKey(path) => {
                    let key = load_key(path)?;
                    handle
                        .authenticate_publickey(self.config.user.as_str(), Arc::new(key))
                        .await
                }
                AuthMethod::Password(password) => {
                    handle
                        .authenticate_password(self.config.user.as_str(), password.as_str())
                        .await
                }
            }
            .map_err(|e| ssh_error("authentication request failed", e))?;

            if accepted {
                info!(
                    session_id = %session_id,
                    addr = %self.config.addr,
                    method = method_name(method),
                    "SSH session established"
                );
                return Ok(SshSession {
                    id: session_id,
                    handle: Arc::new(Mutex::new(handle)),
                    forwards,
                    closed,
                });
            }

            debug!(method = method_name(method), "Authentication method rejected");
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "authentication failed", "")
            .await;
        Err(TransportError::AuthenticationFailed(format!(
            "server rejected all {} method(s) for user {}",
            auth.len(),
            self.config.user
        )))
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.user, self.config.addr)
    }
}

/// Session-level failures stay `SessionClosed`; anything else means the server
/// would not run the command
fn exec_error(context: &str, err: russh::Error) -> TransportError {
    match ssh_error(context, err) {
        TransportError::ConnectionError(reason) => TransportError::ExecFailed(reason),
        other => other,
    }
}

fn method_name(method: &AuthMethod) -> &'static str {
    match method {
        AuthMethod::PrivateKey(_) => "publickey",
        AuthMethod::Password(_) => "password",
    }
}

/// Read and decode an unencrypted private key
pub(crate) fn load_key(path: &Path) -> TransportResult<russh_keys::key::KeyPair> {
    russh_keys::load_secret_key(path, None).map_err(|e| {
        TransportError::ConfigurationError(format!(
            "failed to load private key {}: {}",
            path.display(),
            e
        ))
    })
}

/// One live SSH connection
pub struct SshSession {
    id: String,
    handle: SharedHandle,
    forwards: ForwardTable<Channel<Msg>>,
    closed: CancellationToken,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl TransportSession for SshSession {
    type Listener = SshRemoteListener;

    async fn listen_remote(&self, endpoint: &Endpoint) -> TransportResult<Self::Listener> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        // Register first so a connection arriving right after the reply is not lost
        let incoming = self.forwards.register(endpoint.port);

        let granted = self
            .handle
            .lock()
            .await
            .tcpip_forward(endpoint.host.as_str(), u32::from(endpoint.port))
            .await;

        match granted {
            Ok(true) => {
                debug!(session_id = %self.id, endpoint = %endpoint, "Remote forward granted");
                Ok(SshRemoteListener::new(
                    endpoint.clone(),
                    incoming,
                    self.handle.clone(),
                    self.forwards.clone(),
                    self.closed.clone(),
                ))
            }
            Ok(false) => {
                self.forwards.unregister(endpoint.port);
                Err(TransportError::BindRejected {
                    endpoint: endpoint.to_string(),
                })
            }
            Err(e) => {
                self.forwards.unregister(endpoint.port);
                Err(ssh_error("tcpip-forward request failed", e))
            }
        }
    }

    async fn dial_remote(&self, endpoint: &Endpoint) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(
                endpoint.host.as_str(),
                u32::from(endpoint.port),
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|e| match e {
                russh::Error::ChannelOpenFailure(reason) => TransportError::ChannelError(format!(
                    "remote host could not reach {}: {:?}",
                    endpoint, reason
                )),
                other => ssh_error("direct-tcpip request failed", other),
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn exec(&self, command: &str) -> TransportResult<ExecOutput> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let mut channel = self
            .handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| exec_error("failed to open channel", e))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| exec_error("failed to start command", e))?;

        let mut result = ExecOutput::default();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => result.output.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    result.output.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    result.exit_status = Some(exit_status)
                }
                Some(ChannelMsg::Failure) => {
                    return Err(TransportError::ExecFailed(format!(
                        "server refused to run: {}",
                        command
                    )));
                }
                Some(ChannelMsg::Close) => break,
                // Channel torn down with the connection
                None if result.exit_status.is_none() => return Err(TransportError::SessionClosed),
                None => break,
                _ => {}
            }
        }

        if result.exit_status.is_none() && self.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        debug!(
            session_id = %self.id,
            command = %command,
            exit_status = ?result.exit_status,
            "Remote command finished"
        );
        Ok(result)
    }

    async fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.forwards.clear();

        if let Err(e) = self
            .handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, reason, "")
            .await
        {
            debug!(session_id = %self.id, error = %e, "Disconnect failed");
        }
        info!(session_id = %self.id, reason = %reason, "SSH session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn session_id(&self) -> &str {
        &self.id
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.closed.is_cancelled() {
            warn!(session_id = %self.id, "SSH session dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_exec_error_keeps_session_loss() {
        assert!(matches!(
            exec_error("failed to open channel", russh::Error::Disconnect),
            TransportError::SessionClosed
        ));
        assert!(matches!(
            exec_error("failed to open channel", russh::Error::SendError),
            TransportError::SessionClosed
        ));
        assert!(matches!(
            exec_error("failed to start command", russh::Error::Inconsistent),
            TransportError::ExecFailed(_)
        ));
    }

    #[test]
    fn test_load_key_missing_file() {
        let err = load_key(Path::new("/nonexistent/id_ed25519")).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[test]
    fn test_load_key_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not a private key\n").unwrap();

        let err = load_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to load private key"));
    }

    #[test]
    fn test_target_format() {
        let connector = SshConnector::new(SshConfig::new(Endpoint::new("example.com", 2222), "ops"));
        assert_eq!(connector.target(), "ops@example.com:2222");
    }

    #[tokio::test]
    async fn test_connect_without_methods() {
        let connector = SshConnector::new(SshConfig::new(Endpoint::new("127.0.0.1", 22), "ops"));
        let err = connector.connect(&[]).await.unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then release it so nothing is listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SshConfig::new(Endpoint::new("127.0.0.1", port), "ops")
            .with_connect_timeout(Duration::from_secs(5));
        let connector = SshConnector::new(config);

        let err = connector
            .connect(&[AuthMethod::Password("secret".to_string())])
            .await
            .unwrap_err();
        assert!(!matches!(err, TransportError::AuthenticationFailed(_)));
    }
}
