//! Remote port occupancy check
//!
//! Runs `netstat -ltn | grep ':<port> '` on the remote host. grep exits 1 when nothing
//! matched, 0 when a listener was found, and 2 or more when something went wrong.

use autotun_transport::{TransportError, TransportSession};
use thiserror::Error;
use tracing::{debug, warn};

/// Whether a remote port looks free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Available,
    Occupied,
}

/// What to do when the probe finds a listener already bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbePolicy {
    /// Log a warning and try to listen anyway
    #[default]
    Lenient,
    /// Report the port as occupied
    Strict,
}

/// The probe could not produce an answer
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run port probe for {port}: {source}")]
    Exec {
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("port probe for {port} reported no exit status")]
    NoExitStatus { port: u16 },

    #[error("port probe for {port} failed with status {status}: {output}")]
    CommandFailed {
        port: u16,
        status: u32,
        output: String,
    },
}

impl ProbeError {
    /// The probe failed because the session itself is gone, not because the remote
    /// host cannot run it
    pub fn is_session_loss(&self) -> bool {
        matches!(
            self,
            ProbeError::Exec {
                source: TransportError::SessionClosed,
                ..
            }
        )
    }
}

/// Command line used to look for a listener on `port`
pub fn probe_command(port: u16) -> String {
    format!("netstat -ltn | grep ':{} '", port)
}

/// Check whether `port` is free on the remote host
///
/// Port 0 asks the remote host to pick a port and is always available.
pub async fn probe<S: TransportSession + ?Sized>(
    session: &S,
    port: u16,
    policy: ProbePolicy,
) -> Result<PortStatus, ProbeError> {
    if port == 0 {
        return Ok(PortStatus::Available);
    }

    let output = session
        .exec(&probe_command(port))
        .await
        .map_err(|source| ProbeError::Exec { port, source })?;

    match output.exit_status {
        Some(1) => {
            debug!(port = port, "Remote port is free");
            Ok(PortStatus::Available)
        }
        Some(0) => match policy {
            ProbePolicy::Lenient => {
                warn!(
                    port = port,
                    listeners = %output.output_lossy().trim_end(),
                    "Remote port appears to be bound, trying anyway"
                );
                Ok(PortStatus::Available)
            }
            ProbePolicy::Strict => Ok(PortStatus::Occupied),
        },
        Some(status) => Err(ProbeError::CommandFailed {
            port,
            status,
            output: output.output_lossy().trim_end().to_string(),
        }),
        None => Err(ProbeError::NoExitStatus { port }),
    }
}
