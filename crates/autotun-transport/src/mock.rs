//! In-memory transport for testing the engine without a remote host
//!
//! A [`MockConnector`] hands out [`MockSession`]s. Sessions are cheap clones of a
//! shared state, so a test can keep a handle to every session the engine opened and
//! drive it from outside: push connections into remote listeners, inject accept
//! failures, pick up the far end of remote dials, or close the session.

use super::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// How the mock answers the remote port probe command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    /// grep found nothing (exit status 1)
    NoMatch,
    /// grep found a listener (exit status 0)
    Match,
    /// Arbitrary exit status
    ExitStatus(u32),
    /// The command could not be started at all
    ExecError,
    /// The connection drops while the command runs
    DropSession,
}

/// Behaviour shared by every session created from one connector
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub probe: ProbeBehavior,
    /// Remote ports the mock refuses to listen on
    pub refused_ports: HashSet<u16>,
    /// Whether `dial_remote` fails
    pub refuse_dials: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            probe: ProbeBehavior::NoMatch,
            refused_ports: HashSet::new(),
            refuse_dials: false,
        }
    }
}

/// Outcome of one `connect` call
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Accept,
    Fail(String),
    RejectAuth,
    /// Never completes, as if the server stopped answering mid-handshake
    Hang,
}

type Incoming = TransportResult<(BoxedStream, String)>;

#[derive(Debug)]
struct SessionInner {
    id: String,
    closed: CancellationToken,
    close_reasons: Mutex<Vec<String>>,
    behavior: Mutex<MockBehavior>,
    listeners: Mutex<HashMap<u16, mpsc::UnboundedSender<Incoming>>>,
    listen_calls: Mutex<Vec<Endpoint>>,
    exec_calls: Mutex<Vec<String>>,
    dialed_tx: mpsc::UnboundedSender<(Endpoint, DuplexStream)>,
    dialed_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Endpoint, DuplexStream)>>,
    next_peer: AtomicUsize,
}

/// Mock session; clones share state
#[derive(Debug, Clone)]
pub struct MockSession {
    inner: Arc<SessionInner>,
}

impl MockSession {
    pub fn new(behavior: MockBehavior) -> Self {
        let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SessionInner {
                id: format!("mock-{}", uuid::Uuid::new_v4()),
                closed: CancellationToken::new(),
                close_reasons: Mutex::new(Vec::new()),
                behavior: Mutex::new(behavior),
                listeners: Mutex::new(HashMap::new()),
                listen_calls: Mutex::new(Vec::new()),
                exec_calls: Mutex::new(Vec::new()),
                dialed_tx,
                dialed_rx: tokio::sync::Mutex::new(dialed_rx),
                next_peer: AtomicUsize::new(1),
            }),
        }
    }

    /// Change how this session answers the port probe
    pub fn set_probe(&self, probe: ProbeBehavior) {
        lock(&self.inner.behavior).probe = probe;
    }

    /// Refuse or allow remote listens on `port` from now on
    pub fn set_port_refused(&self, port: u16, refused: bool) {
        let mut behavior = lock(&self.inner.behavior);
        if refused {
            behavior.refused_ports.insert(port);
        } else {
            behavior.refused_ports.remove(&port);
        }
    }

    /// Endpoints passed to `listen_remote`, in call order
    pub fn listen_calls(&self) -> Vec<Endpoint> {
        lock(&self.inner.listen_calls).clone()
    }

    /// Commands passed to `exec`, in call order
    pub fn exec_calls(&self) -> Vec<String> {
        lock(&self.inner.exec_calls).clone()
    }

    /// Reasons given to `close`, in call order
    pub fn close_reasons(&self) -> Vec<String> {
        lock(&self.inner.close_reasons).clone()
    }

    /// Whether a remote listener is currently registered on `port`
    pub fn is_listening(&self, port: u16) -> bool {
        lock(&self.inner.listeners).contains_key(&port)
    }

    /// Simulate a client connecting to the remote listener on `port`
    ///
    /// Returns the client's end of the connection.
    pub fn connect_to(&self, port: u16) -> TransportResult<DuplexStream> {
        let sender = lock(&self.inner.listeners)
            .get(&port)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionError(format!("nothing listening on {port}")))?;

        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let peer = format!(
            "203.0.113.1:{}",
            40000 + self.inner.next_peer.fetch_add(1, Ordering::SeqCst)
        );
        sender
            .send(Ok((Box::new(server), peer)))
            .map_err(|_| TransportError::SessionClosed)?;
        Ok(client)
    }

    /// Make the remote listener on `port` report `count` accept failures
    pub fn fail_accepts(&self, port: u16, count: usize) -> TransportResult<()> {
        let sender = lock(&self.inner.listeners)
            .get(&port)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionError(format!("nothing listening on {port}")))?;

        for i in 0..count {
            sender
                .send(Err(TransportError::ChannelError(format!(
                    "injected accept failure {}",
                    i + 1
                ))))
                .map_err(|_| TransportError::SessionClosed)?;
        }
        Ok(())
    }

    /// Wait for the next `dial_remote` and return the remote end of it
    pub async fn next_dial(&self) -> Option<(Endpoint, DuplexStream)> {
        self.inner.dialed_rx.lock().await.recv().await
    }

    /// Simulate the remote host dropping the session
    pub fn drop_connection(&self) {
        self.shutdown("connection lost");
    }

    fn shutdown(&self, reason: &str) {
        lock(&self.inner.close_reasons).push(reason.to_string());
        // Dropping the senders ends every remote accept loop
        lock(&self.inner.listeners).clear();
        self.inner.closed.cancel();
    }
}

#[async_trait]
impl TransportSession for MockSession {
    type Listener = MockRemoteListener;

    async fn listen_remote(&self, endpoint: &Endpoint) -> TransportResult<Self::Listener> {
        lock(&self.inner.listen_calls).push(endpoint.clone());

        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        if lock(&self.inner.behavior)
            .refused_ports
            .contains(&endpoint.port)
        {
            return Err(TransportError::BindRejected {
                endpoint: endpoint.to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.listeners).insert(endpoint.port, tx);

        Ok(MockRemoteListener {
            endpoint: endpoint.clone(),
            rx,
        })
    }

    async fn dial_remote(&self, endpoint: &Endpoint) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        if lock(&self.inner.behavior).refuse_dials {
            return Err(TransportError::ChannelError(format!(
                "connect to {endpoint} refused"
            )));
        }

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        self.inner
            .dialed_tx
            .send((endpoint.clone(), remote))
            .map_err(|_| TransportError::SessionClosed)?;
        Ok(Box::new(local))
    }

    async fn exec(&self, command: &str) -> TransportResult<ExecOutput> {
        lock(&self.inner.exec_calls).push(command.to_string());

        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let probe = lock(&self.inner.behavior).probe;
        match probe {
            ProbeBehavior::NoMatch => Ok(ExecOutput {
                exit_status: Some(1),
                output: Vec::new(),
            }),
            ProbeBehavior::Match => Ok(ExecOutput {
                exit_status: Some(0),
                output: b"tcp        0      0 0.0.0.0:9000            0.0.0.0:*               LISTEN\n"
                    .to_vec(),
            }),
            ProbeBehavior::ExitStatus(code) => Ok(ExecOutput {
                exit_status: Some(code),
                output: b"sh: 1: netstat: not found\n".to_vec(),
            }),
            ProbeBehavior::ExecError => Err(TransportError::ExecFailed(
                "exec request rejected".to_string(),
            )),
            ProbeBehavior::DropSession => {
                self.shutdown("connection lost");
                Err(TransportError::SessionClosed)
            }
        }
    }

    async fn close(&self, reason: &str) {
        if !self.is_closed() {
            self.shutdown(reason);
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    fn session_id(&self) -> &str {
        &self.inner.id
    }
}

/// Remote listener handed out by [`MockSession::listen_remote`]
#[derive(Debug)]
pub struct MockRemoteListener {
    endpoint: Endpoint,
    rx: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl StreamListener for MockRemoteListener {
    async fn accept(&mut self) -> TransportResult<(BoxedStream, String)> {
        match self.rx.recv().await {
            Some(incoming) => incoming,
            None => Err(TransportError::SessionClosed),
        }
    }

    fn local_description(&self) -> String {
        self.endpoint.to_string()
    }
}

#[derive(Debug)]
struct ConnectorInner {
    behavior: Mutex<MockBehavior>,
    script: Mutex<VecDeque<ConnectOutcome>>,
    sessions: Mutex<Vec<MockSession>>,
    auth_seen: Mutex<Vec<Vec<AuthMethod>>>,
    attempts: AtomicUsize,
}

/// Mock connector; clones share state
#[derive(Debug, Clone)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                behavior: Mutex::new(behavior),
                script: Mutex::new(VecDeque::new()),
                sessions: Mutex::new(Vec::new()),
                auth_seen: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue outcomes for the next `connect` calls; once drained, connects succeed
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        lock(&self.inner.script).extend(outcomes);
    }

    /// Behaviour for sessions created after this call
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.inner.behavior) = behavior;
    }

    /// Number of `connect` calls so far
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Every session handed out so far, oldest first
    pub fn sessions(&self) -> Vec<MockSession> {
        lock(&self.inner.sessions).clone()
    }

    /// Most recently created session
    pub fn last_session(&self) -> Option<MockSession> {
        lock(&self.inner.sessions).last().cloned()
    }

    /// Authentication methods passed to each `connect` call
    pub fn auth_seen(&self) -> Vec<Vec<AuthMethod>> {
        lock(&self.inner.auth_seen).clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, auth: &[AuthMethod]) -> TransportResult<Self::Session> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.auth_seen).push(auth.to_vec());

        let outcome = lock(&self.inner.script)
            .pop_front()
            .unwrap_or(ConnectOutcome::Accept);

        match outcome {
            ConnectOutcome::Accept => {
                let behavior = lock(&self.inner.behavior).clone();
                let session = MockSession::new(behavior);
                lock(&self.inner.sessions).push(session.clone());
                Ok(session)
            }
            ConnectOutcome::Fail(reason) => Err(TransportError::ConnectionError(reason)),
            ConnectOutcome::RejectAuth => Err(TransportError::AuthenticationFailed(
                "all methods rejected".to_string(),
            )),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }

    fn target(&self) -> String {
        "mock:22".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
