//! SSH transport implementation using russh
//!
//! Maps the transport traits onto a single SSH connection:
//!
//! - `listen_remote` sends a `tcpip-forward` global request; connections the server
//!   accepts come back as `forwarded-tcpip` channels
//! - `dial_remote` opens a `direct-tcpip` channel
//! - `exec` runs a command on a fresh session channel and collects its output
//!
//! # Example
//!
//! ```no_run
//! use autotun_transport::{AuthMethod, TransportConnector};
//! use autotun_transport_ssh::{SshConfig, SshConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshConfig::new("ssh.example.com:22".parse()?, "deploy");
//! let connector = SshConnector::new(config);
//! let session = connector
//!     .connect(&[AuthMethod::Password("secret".to_string())])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod handler;
pub mod listener;
pub mod session;

pub use config::SshConfig;
pub use listener::SshRemoteListener;
pub use session::{SshConnector, SshSession};

use autotun_transport::TransportError;

pub(crate) fn ssh_error(context: &str, err: russh::Error) -> TransportError {
    match err {
        russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => {
            TransportError::SessionClosed
        }
        russh::Error::IO(io) => TransportError::IoError(io),
        other => TransportError::ConnectionError(format!("{}: {}", context, other)),
    }
}
