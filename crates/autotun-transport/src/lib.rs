//! Transport abstraction layer for the forwarding engine
//!
//! This crate provides the traits the supervisor and tunnel listeners use to talk to
//! the remote host, without coupling the engine to a specific transport library.
//!
//! # Design Principles
//!
//! 1. **Transport Independence**: the engine only sees sessions, listeners and streams
//! 2. **Single Owner**: a session is created by a connector and closed through its own handle
//! 3. **Observable Closure**: every session can be awaited until it is gone
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Forwarding Engine                       │
//! │     (supervisor, tunnel listeners, port prober)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            autotun-transport (this crate)                │
//! │  - TransportConnector   - TransportSession               │
//! │  - StreamListener       - BoxedStream                    │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────────────────────┬────────────────────────────┐
//! │ autotun-transport-ssh      │ mock (feature = "mock")    │
//! └────────────────────────────┴────────────────────────────┘
//! ```

mod endpoint;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use endpoint::{Endpoint, EndpointParseError};

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Remote side refused to listen on {endpoint}")]
    BindRejected { endpoint: String },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Remote command could not be executed: {0}")]
    ExecFailed(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Anything that can carry the bytes of one forwarded TCP connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased connection, either a plain TCP socket or a transport channel
pub type BoxedStream = Box<dyn AsyncStream>;

/// One authentication method handed to the transport library
///
/// Methods are tried in the order they are given.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Private key file, read and decoded by the transport on every connect
    PrivateKey(PathBuf),
    /// Plain password
    Password(String),
}

impl Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Combined output and exit status of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status reported by the remote side, if any was reported
    pub exit_status: Option<u32>,
    /// stdout and stderr, interleaved in arrival order
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// A listening socket that yields incoming connections
///
/// Implemented for local `tokio::net::TcpListener`s and for remote listeners opened
/// through a transport session.
#[async_trait]
pub trait StreamListener: Send + Debug + 'static {
    /// Wait for the next incoming connection
    ///
    /// Returns the connection and a printable description of the peer.
    async fn accept(&mut self) -> TransportResult<(BoxedStream, String)>;

    /// Printable description of the address this listener is bound to
    fn local_description(&self) -> String;
}

#[async_trait]
impl StreamListener for tokio::net::TcpListener {
    async fn accept(&mut self) -> TransportResult<(BoxedStream, String)> {
        let (stream, peer) = tokio::net::TcpListener::accept(&*self).await?;
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_description(&self) -> String {
        self.local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// An authenticated connection to the remote host
///
/// Shared by the supervisor and every tunnel listener. Only the supervisor creates
/// sessions; anyone holding one may close it, and everyone can observe the closure.
#[async_trait]
pub trait TransportSession: Send + Sync + Debug + 'static {
    /// Listener type returned by [`TransportSession::listen_remote`]
    type Listener: StreamListener;

    /// Ask the remote host to listen on `endpoint` and hand incoming connections back
    async fn listen_remote(&self, endpoint: &Endpoint) -> TransportResult<Self::Listener>;

    /// Open a connection from the remote host to `endpoint`
    async fn dial_remote(&self, endpoint: &Endpoint) -> TransportResult<BoxedStream>;

    /// Run a single command on the remote host and capture its output
    async fn exec(&self, command: &str) -> TransportResult<ExecOutput>;

    /// Close the session; idempotent
    async fn close(&self, reason: &str);

    /// Check if the session is closed
    fn is_closed(&self) -> bool;

    /// Resolve once the session is closed, whoever closed it
    async fn closed(&self);

    /// Stable identifier for logging and correlation
    fn session_id(&self) -> &str;
}

/// Establishes authenticated sessions with the remote host
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug + 'static {
    /// The session type created by this connector
    type Session: TransportSession;

    /// Dial and authenticate
    ///
    /// Must return [`TransportError::AuthenticationFailed`] when the remote host
    /// rejected every method, so callers can tell it apart from network failures.
    async fn connect(&self, auth: &[AuthMethod]) -> TransportResult<Self::Session>;

    /// Human-readable target, for logs
    fn target(&self) -> String;
}

#[cfg(test)]
mod tests;
