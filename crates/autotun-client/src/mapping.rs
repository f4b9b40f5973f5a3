//! Port mapping definitions

use autotun_transport::{Endpoint, EndpointParseError};
use std::fmt;
use thiserror::Error;

/// Which side listens and which side is dialed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Listen on the remote host, dial locally
    RemoteToLocal,
    /// Listen locally, dial from the remote host
    LocalToRemote,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::RemoteToLocal => "rtl",
            Direction::LocalToRemote => "ltr",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while parsing a `"local,remote"` pair
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingParseError {
    #[error("invalid address count in pair, expected 2, got: {0}")]
    AddressCount(usize),

    #[error("invalid {side} address: {source}")]
    Endpoint {
        side: &'static str,
        #[source]
        source: EndpointParseError,
    },
}

/// One configured port forward
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingSpec {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub direction: Direction,
}

impl MappingSpec {
    pub fn new(local: Endpoint, remote: Endpoint, direction: Direction) -> Self {
        Self {
            local,
            remote,
            direction,
        }
    }

    /// Parse a `"local:port,remote:port"` pair
    pub fn parse(pair: &str, direction: Direction) -> Result<Self, MappingParseError> {
        let parts: Vec<&str> = pair.split(',').collect();
        if parts.len() != 2 {
            return Err(MappingParseError::AddressCount(parts.len()));
        }

        let local = parts[0]
            .parse()
            .map_err(|source| MappingParseError::Endpoint {
                side: "local",
                source,
            })?;
        let remote = parts[1]
            .parse()
            .map_err(|source| MappingParseError::Endpoint {
                side: "remote",
                source,
            })?;

        Ok(Self::new(local, remote, direction))
    }

    /// Endpoint the tunnel listener binds
    pub fn listen_endpoint(&self) -> &Endpoint {
        match self.direction {
            Direction::RemoteToLocal => &self.remote,
            Direction::LocalToRemote => &self.local,
        }
    }

    /// Endpoint every accepted connection is forwarded to
    pub fn target_endpoint(&self) -> &Endpoint {
        match self.direction {
            Direction::RemoteToLocal => &self.local,
            Direction::LocalToRemote => &self.remote,
        }
    }

    /// Side labels for log lines, listening side first
    pub(crate) fn sides(&self) -> (&'static str, &'static str) {
        match self.direction {
            Direction::RemoteToLocal => ("Remote", "Local"),
            Direction::LocalToRemote => ("Local", "Remote"),
        }
    }
}

impl fmt::Display for MappingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (listen_side, target_side) = self.sides();
        write!(
            f,
            "[{}]{} --> [{}]{}",
            listen_side,
            self.listen_endpoint(),
            target_side,
            self.target_endpoint()
        )
    }
}

/// Parse configured pairs, remote-to-local entries first
///
/// Malformed pairs are logged and skipped.
pub fn parse_mappings<R, L>(rtl: R, ltr: L) -> Vec<MappingSpec>
where
    R: IntoIterator,
    R::Item: AsRef<str>,
    L: IntoIterator,
    L::Item: AsRef<str>,
{
    let rtl = rtl
        .into_iter()
        .map(|pair| (pair.as_ref().to_string(), Direction::RemoteToLocal));
    let ltr = ltr
        .into_iter()
        .map(|pair| (pair.as_ref().to_string(), Direction::LocalToRemote));

    rtl.chain(ltr)
        .filter_map(|(pair, direction)| match MappingSpec::parse(&pair, direction) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!(
                    pair = %pair,
                    direction = %direction,
                    error = %e,
                    "Skipping invalid mapping"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        let spec = MappingSpec::parse("127.0.0.1:2222, 0.0.0.0:9000", Direction::RemoteToLocal)
            .unwrap();
        assert_eq!(spec.local, Endpoint::new("127.0.0.1", 2222));
        assert_eq!(spec.remote, Endpoint::new("0.0.0.0", 9000));
        assert_eq!(spec.listen_endpoint().port, 9000);
        assert_eq!(spec.target_endpoint().port, 2222);
    }

    #[test]
    fn test_address_count_error() {
        assert_eq!(
            MappingSpec::parse("127.0.0.1:2222", Direction::LocalToRemote),
            Err(MappingParseError::AddressCount(1))
        );
        let err = MappingSpec::parse("a:1,b:2,c:3", Direction::LocalToRemote).unwrap_err();
        assert_eq!(err.to_string(), "invalid address count in pair, expected 2, got: 3");
    }

    #[test]
    fn test_bad_endpoint_names_side() {
        let err = MappingSpec::parse("127.0.0.1:2222,nowhere", Direction::RemoteToLocal)
            .unwrap_err();
        assert!(matches!(err, MappingParseError::Endpoint { side: "remote", .. }));
    }

    #[test]
    fn test_display_direction() {
        let rtl = MappingSpec::parse("127.0.0.1:2222,0.0.0.0:9000", Direction::RemoteToLocal)
            .unwrap();
        assert_eq!(rtl.to_string(), "[Remote]0.0.0.0:9000 --> [Local]127.0.0.1:2222");

        let ltr = MappingSpec::parse("127.0.0.1:15432,10.0.0.5:5432", Direction::LocalToRemote)
            .unwrap();
        assert_eq!(ltr.to_string(), "[Local]127.0.0.1:15432 --> [Remote]10.0.0.5:5432");
    }

    #[test]
    fn test_parse_mappings_order_and_skipping() {
        let specs = parse_mappings(
            ["127.0.0.1:2222,0.0.0.0:9000", "broken"],
            vec!["127.0.0.1:15432,10.0.0.5:5432".to_string()],
        );

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].direction, Direction::RemoteToLocal);
        assert_eq!(specs[1].direction, Direction::LocalToRemote);
    }

    #[test]
    fn test_parse_mappings_empty() {
        let none: [&str; 0] = [];
        assert!(parse_mappings(none, none).is_empty());
    }
}
