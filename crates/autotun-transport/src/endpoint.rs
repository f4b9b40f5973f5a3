use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a `host:port` endpoint
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("missing port in address: {0}")]
    MissingPort(String),

    #[error("missing host in address: {0}")]
    MissingHost(String),

    #[error("invalid port in address {address}: {port}")]
    InvalidPort { address: String, port: String },

    #[error("unterminated IPv6 literal in address: {0}")]
    UnterminatedIpv6(String),
}

/// A TCP endpoint as written in configuration (`host:port` or `[v6]:port`)
///
/// The host is kept verbatim so it can be handed to the remote side unresolved;
/// the remote host is the one that decides what `0.0.0.0` or `localhost` means.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointParseError::UnterminatedIpv6(s.to_string()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?
        };

        if host.is_empty() {
            return Err(EndpointParseError::MissingHost(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort {
                address: s.to_string(),
                port: port.to_string(),
            })?;

        Ok(Self::new(host, port))
    }
}
