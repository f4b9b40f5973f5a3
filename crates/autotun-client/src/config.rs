//! Supervisor configuration and credentials

use crate::listener::ListenerSettings;
use crate::prober::ProbePolicy;
use autotun_transport::AuthMethod;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Timing and policy knobs for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay between a lost or failed session and the next connect attempt
    pub reconnect_backoff: Duration,
    /// Delay after a pass that left every mapping forwarded
    pub full_sync_interval: Duration,
    /// Delay after a pass that left at least one mapping unforwarded
    pub retry_interval: Duration,
    /// Consecutive accept failures tolerated before a listener closes the session
    pub accept_failure_threshold: u32,
    /// How a detected remote listener is treated
    pub probe_policy: ProbePolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(10),
            full_sync_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            accept_failure_threshold: 10,
            probe_policy: ProbePolicy::Lenient,
        }
    }
}

impl SupervisorConfig {
    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            accept_failure_threshold: self.accept_failure_threshold,
            probe_policy: self.probe_policy,
        }
    }
}

/// Login material for the remote host
#[derive(Clone, Default)]
pub struct Credentials {
    pub private_key: Option<PathBuf>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(private_key: Option<PathBuf>, password: Option<String>) -> Self {
        Self {
            private_key,
            password,
        }
    }

    /// Authentication methods in the order they are tried: key first, then password
    ///
    /// Empty values count as absent.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        let mut methods = Vec::with_capacity(2);
        if let Some(key) = self.private_key.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            methods.push(AuthMethod::PrivateKey(key.clone()));
        }
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            methods.push(AuthMethod::Password(password.clone()));
        }
        methods
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &self.private_key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cadence() {
        let config = SupervisorConfig::default();
        assert_eq!(config.reconnect_backoff, Duration::from_secs(10));
        assert_eq!(config.full_sync_interval, Duration::from_secs(10));
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.accept_failure_threshold, 10);
        assert_eq!(config.probe_policy, ProbePolicy::Lenient);
    }

    #[test]
    fn test_key_before_password() {
        let creds = Credentials::new(
            Some(PathBuf::from("/keys/id_ed25519")),
            Some("secret".to_string()),
        );
        assert_eq!(
            creds.auth_methods(),
            vec![
                AuthMethod::PrivateKey(PathBuf::from("/keys/id_ed25519")),
                AuthMethod::Password("secret".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_values_are_absent() {
        let creds = Credentials::new(Some(PathBuf::new()), Some(String::new()));
        assert!(creds.auth_methods().is_empty());
        assert!(Credentials::default().auth_methods().is_empty());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new(None, Some("hunter2".to_string()));
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
