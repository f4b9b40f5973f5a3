//! SSH transport configuration

use autotun_transport::Endpoint;
use std::time::Duration;

/// SSH-specific configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Server address
    pub addr: Endpoint,

    /// Login user
    pub user: String,

    /// Upper bound for TCP connect plus handshake
    pub connect_timeout: Duration,

    /// Interval between keepalive requests; `None` disables them
    pub keepalive_interval: Option<Duration>,

    /// Unanswered keepalives before the connection is considered dead
    pub keepalive_max: usize,
}

impl SshConfig {
    pub fn new(addr: Endpoint, user: impl Into<String>) -> Self {
        Self {
            addr,
            user: user.into(),
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub(crate) fn russh_config(&self) -> russh::client::Config {
        russh::client::Config {
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SshConfig::new(Endpoint::new("example.com", 22), "root");
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.keepalive_max, 3);
    }

    #[test]
    fn test_builders() {
        let config = SshConfig::new(Endpoint::new("example.com", 2222), "root")
            .with_connect_timeout(Duration::from_secs(5))
            .with_keepalive(None);

        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.russh_config().keepalive_interval.is_none());
    }
}
