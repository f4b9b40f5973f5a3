//! Connection supervisor
//!
//! Owns the transport session lifecycle. One run looks like:
//!
//! ```text
//!   Disconnected ──▶ Connecting ──▶ Connected ──(session lost)──▶ Disconnected
//!         ▲               │             │
//!         └──(failure)────┘             └──(stop)──▶ Draining ──▶ Stopped
//! ```
//!
//! While connected the supervisor runs reconciliation passes: every mapping without
//! a running listener is started, then the supervisor sleeps for the long interval if
//! everything is forwarded or the short one otherwise.

use crate::config::{Credentials, SupervisorConfig};
use crate::listener::{StartError, TunnelListener};
use crate::mapping::MappingSpec;
use crate::prober::ProbeError;
use crate::registry::Registry;
use autotun_transport::{AuthMethod, TransportConnector, TransportError, TransportSession};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fatal supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no authentication method configured, set a password or a private key file")]
    NoAuthMethods,

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("authentication rejected by server: {0}")]
    AuthenticationRejected(String),

    #[error("remote port probe unavailable: {0}")]
    ProbeUnavailable(#[from] ProbeError),
}

/// Lifecycle state, published on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected { retry_at: Option<Instant> },
    Connecting,
    Connected { session_id: String },
    Draining,
    Stopped,
}

impl SupervisorState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SupervisorState::Connected { .. })
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub started: usize,
    pub failed: usize,
}

/// Registry view published after every pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Passes completed since the supervisor started
    pub passes: u64,
    /// Sessions established since the supervisor started
    pub sessions: u64,
    pub forwarded: Vec<bool>,
    pub last_report: Option<PassReport>,
}

impl RegistrySnapshot {
    pub fn forwarded_count(&self) -> usize {
        self.forwarded.iter().filter(|f| **f).count()
    }

    pub fn is_fully_forwarded(&self) -> bool {
        self.forwarded.iter().all(|f| *f)
    }
}

/// Transitions kept for slow `transitions()` subscribers
const TRANSITION_BUFFER: usize = 64;

/// Cloneable control handle for a running supervisor
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    stop: CancellationToken,
    state: watch::Receiver<SupervisorState>,
    registry: watch::Receiver<RegistrySnapshot>,
    transitions: broadcast::Sender<SupervisorState>,
}

impl SupervisorHandle {
    /// Request shutdown; idempotent
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("Stop requested");
        }
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Every state change from now on, in order
    ///
    /// Unlike [`subscribe`](Self::subscribe), short-lived states such as `Draining` are
    /// never coalesced away.
    pub fn transitions(&self) -> broadcast::Receiver<SupervisorState> {
        self.transitions.subscribe()
    }

    pub fn registry(&self) -> RegistrySnapshot {
        self.registry.borrow().clone()
    }

    pub fn subscribe_registry(&self) -> watch::Receiver<RegistrySnapshot> {
        self.registry.clone()
    }

    /// Wait until the supervisor reports `Stopped` or goes away
    pub async fn wait_stopped(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|s| matches!(s, SupervisorState::Stopped))
            .await;
    }
}

enum SessionEnd {
    Lost,
    Stopped,
}

/// Keeps every mapping forwarded over a self-healing session
pub struct Supervisor<C: TransportConnector> {
    connector: C,
    credentials: Credentials,
    config: SupervisorConfig,
    registry: Registry,
    stop: CancellationToken,
    state_tx: watch::Sender<SupervisorState>,
    registry_tx: watch::Sender<RegistrySnapshot>,
    transitions_tx: broadcast::Sender<SupervisorState>,
    snapshot: RegistrySnapshot,
}

impl<C: TransportConnector> Supervisor<C> {
    pub fn new(
        connector: C,
        mappings: Vec<MappingSpec>,
        credentials: Credentials,
        config: SupervisorConfig,
    ) -> Self {
        let registry = Registry::new(mappings);
        let snapshot = RegistrySnapshot {
            forwarded: registry.forwarded_flags(),
            ..Default::default()
        };
        let (state_tx, _) = watch::channel(SupervisorState::Disconnected { retry_at: None });
        let (registry_tx, _) = watch::channel(snapshot.clone());
        let (transitions_tx, _) = broadcast::channel(TRANSITION_BUFFER);

        Self {
            connector,
            credentials,
            config,
            registry,
            stop: CancellationToken::new(),
            state_tx,
            registry_tx,
            transitions_tx,
            snapshot,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            stop: self.stop.clone(),
            state: self.state_tx.subscribe(),
            registry: self.registry_tx.subscribe(),
            transitions: self.transitions_tx.clone(),
        }
    }

    /// Run until stopped or a fatal error occurs
    ///
    /// Returns `Ok(())` after a requested stop.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let result = match self.auth_methods() {
            Ok(auth) => {
                info!(
                    target_host = %self.connector.target(),
                    mappings = self.registry.len(),
                    "Starting supervisor"
                );
                self.run_sessions(&auth).await
            }
            Err(e) => Err(e),
        };

        self.registry.reset_all();
        self.publish_registry(None);
        self.set_state(SupervisorState::Stopped);

        if let Err(e) = &result {
            error!(error = %e, "Supervisor stopped on fatal error");
        }
        result
    }

    fn auth_methods(&self) -> Result<Vec<AuthMethod>, SupervisorError> {
        let methods = self.credentials.auth_methods();
        if methods.is_empty() {
            return Err(SupervisorError::NoAuthMethods);
        }

        for method in &methods {
            if let AuthMethod::PrivateKey(path) = method {
                if !path.is_file() {
                    return Err(SupervisorError::InvalidCredentials(format!(
                        "private key file not found: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(methods)
    }

    async fn run_sessions(&mut self, auth: &[AuthMethod]) -> Result<(), SupervisorError> {
        loop {
            if self.stop.is_cancelled() {
                self.set_state(SupervisorState::Draining);
                return Ok(());
            }

            self.set_state(SupervisorState::Connecting);
            info!(target_host = %self.connector.target(), "Connecting");

            let connected = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.set_state(SupervisorState::Draining);
                    return Ok(());
                }
                connected = self.connector.connect(auth) => connected,
            };

            match connected {
                Ok(session) => {
                    let session = Arc::new(session);
                    match self.serve(session.clone()).await {
                        Ok(SessionEnd::Stopped) => return Ok(()),
                        Ok(SessionEnd::Lost) => {}
                        Err(e) => {
                            session.close("fatal error").await;
                            return Err(e);
                        }
                    }
                }
                Err(TransportError::AuthenticationFailed(reason)) => {
                    return Err(SupervisorError::AuthenticationRejected(reason));
                }
                Err(TransportError::ConfigurationError(reason)) => {
                    return Err(SupervisorError::InvalidCredentials(reason));
                }
                Err(e) => {
                    warn!(
                        target_host = %self.connector.target(),
                        error = %e,
                        retry_secs = self.config.reconnect_backoff.as_secs(),
                        "Connection failed"
                    );
                }
            }

            let retry_at = Instant::now() + self.config.reconnect_backoff;
            self.set_state(SupervisorState::Disconnected {
                retry_at: Some(retry_at),
            });

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.set_state(SupervisorState::Draining);
                    return Ok(());
                }
                _ = tokio::time::sleep_until(retry_at) => {}
            }
        }
    }

    async fn serve(&mut self, session: Arc<C::Session>) -> Result<SessionEnd, SupervisorError> {
        let session_id = session.session_id().to_string();
        let session_token = self.stop.child_token();

        // Fresh session: nothing from the previous one is reused
        self.registry.reset_all();
        self.snapshot.sessions += 1;
        self.publish_registry(None);
        self.set_state(SupervisorState::Connected {
            session_id: session_id.clone(),
        });

        tokio::spawn(watch_closure(session.clone(), session_token.clone()));

        loop {
            let report = self.reconcile(&session, &session_token).await?;
            self.publish_registry(Some(report));

            let delay = if self.registry.is_fully_forwarded() {
                self.config.full_sync_interval
            } else {
                let missing = self.registry.len() - self.registry.forwarded_count();
                info!(
                    session_id = %session_id,
                    not_forwarded = missing,
                    retry_secs = self.config.retry_interval.as_secs(),
                    "{} mapping(s) not forwarded, retry after {}s",
                    missing,
                    self.config.retry_interval.as_secs()
                );
                self.config.retry_interval
            };

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.set_state(SupervisorState::Draining);
                    session_token.cancel();
                    self.registry.reset_all();
                    session.close("shutdown").await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = session_token.cancelled() => {
                    warn!(session_id = %session_id, "Session closed, will reconnect");
                    session.close("session lost").await;
                    return Ok(SessionEnd::Lost);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Try to start every unforwarded mapping, in order
    async fn reconcile(
        &mut self,
        session: &Arc<C::Session>,
        session_token: &CancellationToken,
    ) -> Result<PassReport, SupervisorError> {
        let reaped = self.registry.reap_finished();
        if reaped > 0 {
            debug!(reaped = reaped, "Dropped listeners whose accept loop exited");
        }

        let settings = self.config.listener_settings();
        let mut report = PassReport::default();

        for index in self.registry.pending() {
            let Some(spec) = self.registry.get(index).map(|s| s.spec().clone()) else {
                continue;
            };
            report.attempted += 1;

            let started = tokio::select! {
                biased;
                _ = session_token.cancelled() => break,
                started = TunnelListener::start(&spec, session.clone(), session_token, &settings) => started,
            };

            match started {
                Ok(handle) => {
                    self.registry.mark_forwarded(index, handle);
                    report.started += 1;
                }
                Err(StartError::SessionClosed) => {
                    warn!(mapping = %spec, "Session lost while forwarding port");
                    session_token.cancel();
                    break;
                }
                Err(StartError::Probe(e)) if session.is_closed() => {
                    warn!(mapping = %spec, error = %e, "Session lost during port probe");
                    session_token.cancel();
                    break;
                }
                Err(StartError::Probe(e)) => return Err(SupervisorError::ProbeUnavailable(e)),
                Err(e) => {
                    report.failed += 1;
                    warn!(mapping = %spec, error = %e, "Failed to forward port");
                }
            }
        }

        if report.attempted > 0 {
            debug!(
                attempted = report.attempted,
                started = report.started,
                failed = report.failed,
                "Reconciliation pass finished"
            );
        }
        Ok(report)
    }

    fn set_state(&self, state: SupervisorState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            debug!(state = ?state, "Supervisor state changed");
            // No subscribers is fine
            let _ = self.transitions_tx.send(state.clone());
        }
        self.state_tx.send_replace(state);
    }

    fn publish_registry(&mut self, report: Option<PassReport>) {
        if let Some(report) = report {
            self.snapshot.passes += 1;
            self.snapshot.last_report = Some(report);
        }
        self.snapshot.forwarded = self.registry.forwarded_flags();
        self.registry_tx.send_replace(self.snapshot.clone());
    }
}

async fn watch_closure<S: TransportSession>(session: Arc<S>, token: CancellationToken) {
    tokio::select! {
        _ = session.closed() => {
            debug!(session_id = %session.session_id(), "Session closure observed");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}
