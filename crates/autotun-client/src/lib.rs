//! Port-forwarding engine
//!
//! Keeps a set of port mappings alive over one persistent transport session:
//!
//! - [`supervisor::Supervisor`] owns the session lifecycle and reconnects after loss
//! - [`registry::Registry`] tracks which mappings currently have a running listener
//! - [`listener::TunnelListener`] runs one mapping's accept loop
//! - [`prober`] checks whether a remote port is already taken
//! - [`copier`] pumps bytes between the two ends of every accepted connection

pub mod config;
pub mod copier;
pub mod listener;
pub mod mapping;
pub mod prober;
pub mod registry;
pub mod supervisor;

pub use config::{Credentials, SupervisorConfig};
pub use copier::{spawn_copy, CopyDirection, CopyHandles, CopyReport};
pub use listener::{ListenerExit, ListenerHandle, ListenerSettings, StartError, TunnelListener};
pub use mapping::{parse_mappings, Direction, MappingParseError, MappingSpec};
pub use prober::{PortStatus, ProbeError, ProbePolicy};
pub use registry::{MappingState, Registry};
pub use supervisor::{
    PassReport, RegistrySnapshot, Supervisor, SupervisorError, SupervisorHandle, SupervisorState,
};

pub use autotun_transport::{Endpoint, EndpointParseError};
