//! Per-mapping listen socket and accept loop

use crate::copier::spawn_copy;
use crate::mapping::{Direction, MappingSpec};
use crate::prober::{self, PortStatus, ProbeError, ProbePolicy};
use async_trait::async_trait;
use autotun_transport::{
    BoxedStream, Endpoint, StreamListener, TransportError, TransportResult, TransportSession,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings shared by every tunnel listener
#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub accept_failure_threshold: u32,
    pub probe_policy: ProbePolicy,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            accept_failure_threshold: 10,
            probe_policy: ProbePolicy::Lenient,
        }
    }
}

/// Why a mapping could not be started
#[derive(Debug, Error)]
pub enum StartError {
    #[error("remote port already in use: {endpoint}")]
    PortOccupied { endpoint: String },

    #[error("failed to listen on {endpoint}: {source}")]
    BindFailed {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// The session went away while the mapping was being started
    #[error("transport session closed")]
    SessionClosed,
}

/// Why an accept loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// Its token was cancelled
    Cancelled,
    /// The transport session went away underneath it
    SessionClosed,
    /// Too many consecutive accept failures; the session was closed
    ThresholdExceeded,
}

/// Reference to a running accept loop
#[derive(Debug)]
pub struct ListenerHandle {
    token: CancellationToken,
    task: JoinHandle<ListenerExit>,
    description: String,
}

impl ListenerHandle {
    /// Address the listener is bound to
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the accept loop to exit
    pub async fn join(mut self) -> ListenerExit {
        match (&mut self.task).await {
            Ok(exit) => exit,
            Err(e) => {
                error!(listener = %self.description, error = %e, "Accept loop task failed");
                ListenerExit::Cancelled
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Starts tunnel listeners
pub struct TunnelListener;

impl TunnelListener {
    /// Open the listen socket for `spec` and spawn its accept loop
    ///
    /// The loop's token is a child of `session_token`, so cancelling the session token
    /// stops every listener of that session.
    pub async fn start<S: TransportSession>(
        spec: &MappingSpec,
        session: Arc<S>,
        session_token: &CancellationToken,
        settings: &ListenerSettings,
    ) -> Result<ListenerHandle, StartError> {
        let token = session_token.child_token();
        let loop_ctx = AcceptContext {
            spec: spec.clone(),
            session: session.clone(),
            token: token.clone(),
            session_token: session_token.clone(),
            threshold: settings.accept_failure_threshold,
        };

        let (task, description) = match spec.direction {
            Direction::RemoteToLocal => {
                let status =
                    match prober::probe(&*session, spec.remote.port, settings.probe_policy).await {
                        Ok(status) => status,
                        Err(e) if e.is_session_loss() || session.is_closed() => {
                            debug!(port = spec.remote.port, error = %e, "Session lost during port probe");
                            return Err(StartError::SessionClosed);
                        }
                        Err(e) => return Err(e.into()),
                    };
                if status == PortStatus::Occupied {
                    return Err(StartError::PortOccupied {
                        endpoint: spec.remote.to_string(),
                    });
                }

                let listener = match session.listen_remote(&spec.remote).await {
                    Ok(listener) => listener,
                    Err(TransportError::SessionClosed) => return Err(StartError::SessionClosed),
                    Err(_) if session.is_closed() => return Err(StartError::SessionClosed),
                    Err(source) => {
                        return Err(StartError::BindFailed {
                            endpoint: spec.remote.to_string(),
                            source,
                        })
                    }
                };
                let description = listener.local_description();
                let dialer = LocalDial {
                    endpoint: spec.local.clone(),
                };
                (tokio::spawn(loop_ctx.run(listener, dialer)), description)
            }
            Direction::LocalToRemote => {
                let listener = TcpListener::bind((spec.local.host.as_str(), spec.local.port))
                    .await
                    .map_err(|e| StartError::BindFailed {
                        endpoint: spec.local.to_string(),
                        source: e.into(),
                    })?;
                let description = StreamListener::local_description(&listener);
                let dialer = RemoteDial {
                    session: session.clone(),
                    endpoint: spec.remote.clone(),
                };
                (tokio::spawn(loop_ctx.run(listener, dialer)), description)
            }
        };

        info!(session_id = %session.session_id(), "Forward port: {}", spec);

        Ok(ListenerHandle {
            token,
            task,
            description,
        })
    }
}

/// Opens the connection on the far side of a mapping
#[async_trait]
trait Dial: Send + Sync + 'static {
    async fn dial(&self) -> TransportResult<BoxedStream>;

    fn endpoint(&self) -> &Endpoint;
}

struct LocalDial {
    endpoint: Endpoint,
}

#[async_trait]
impl Dial for LocalDial {
    async fn dial(&self) -> TransportResult<BoxedStream> {
        let stream = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

struct RemoteDial<S> {
    session: Arc<S>,
    endpoint: Endpoint,
}

#[async_trait]
impl<S: TransportSession> Dial for RemoteDial<S> {
    async fn dial(&self) -> TransportResult<BoxedStream> {
        self.session.dial_remote(&self.endpoint).await
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

struct AcceptContext<S> {
    spec: MappingSpec,
    session: Arc<S>,
    token: CancellationToken,
    session_token: CancellationToken,
    threshold: u32,
}

impl<S: TransportSession> AcceptContext<S> {
    async fn run<L, D>(self, mut listener: L, dialer: D) -> ListenerExit
    where
        L: StreamListener,
        D: Dial,
    {
        let dialer = Arc::new(dialer);
        let (listen_side, target_side) = self.spec.sides();
        let listen_desc = listener.local_description();
        let mut failures: u32 = 0;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!(listener = %listen_desc, "Accept loop cancelled");
                    return ListenerExit::Cancelled;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    let route = format!(
                        "[{side}]{peer} --> [{side}]{listen} --> [{target_side}]{target}",
                        side = listen_side,
                        peer = peer,
                        listen = listen_desc,
                        target_side = target_side,
                        target = dialer.endpoint(),
                    );
                    info!("Accepted incoming connection: {}", route);
                    tokio::spawn(forward(stream, dialer.clone(), route));
                }
                Err(e) => {
                    if self.session.is_closed() || self.session_token.is_cancelled() {
                        debug!(listener = %listen_desc, "Session closed, accept loop exiting");
                        return ListenerExit::SessionClosed;
                    }

                    failures += 1;
                    warn!(
                        listener = %listen_desc,
                        failures = failures,
                        error = %e,
                        "Failed to accept incoming connection"
                    );

                    if failures > self.threshold {
                        error!(
                            listener = %listen_desc,
                            failures = failures,
                            "Accept failures exceeded threshold, closing session"
                        );
                        self.session
                            .close("accept failure threshold exceeded")
                            .await;
                        self.session_token.cancel();
                        return ListenerExit::ThresholdExceeded;
                    }
                }
            }
        }
    }
}

async fn forward<D: Dial>(inbound: BoxedStream, dialer: Arc<D>, route: String) {
    match dialer.dial().await {
        Ok(outbound) => {
            // Fire-and-forget; each direction logs its own outcome
            let _ = spawn_copy(inbound, outbound, route);
        }
        Err(e) => {
            warn!(
                endpoint = %dialer.endpoint(),
                error = %e,
                "Failed to dial target, dropping connection"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ListenerSettings::default();
        assert_eq!(settings.accept_failure_threshold, 10);
        assert_eq!(settings.probe_policy, ProbePolicy::Lenient);
    }

    #[test]
    fn test_start_error_messages() {
        let err = StartError::PortOccupied {
            endpoint: "0.0.0.0:9000".to_string(),
        };
        assert_eq!(err.to_string(), "remote port already in use: 0.0.0.0:9000");

        let err = StartError::BindFailed {
            endpoint: "127.0.0.1:80".to_string(),
            source: TransportError::BindRejected {
                endpoint: "127.0.0.1:80".to_string(),
            },
        };
        assert!(err.to_string().starts_with("failed to listen on 127.0.0.1:80"));

        assert_eq!(StartError::SessionClosed.to_string(), "transport session closed");
    }
}
