//! YAML configuration file support
//!
//! The configuration is looked up in the working directory, trying
//! `config.private.yaml` first so credentials can live outside the tracked
//! `config.yaml`.

use anyhow::{Context, Result};
use autotun_client::{parse_mappings, Credentials, MappingSpec, ProbePolicy, SupervisorConfig};
use autotun_transport::{Endpoint, EndpointParseError};
use autotun_transport_ssh::SshConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File names tried during discovery, in order
pub const CONFIG_FILE_NAMES: [&str; 2] = ["config.private.yaml", "config.yaml"];

/// Port used when the server address has none
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Top-level configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,

    #[serde(default)]
    pub mappings: MappingsConfig,

    #[serde(default)]
    pub tunnel: TunnelTuning,
}

/// SSH server and login
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host` or `host:port`
    pub addr: String,

    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Private key file; `~/` is the home directory, other relative paths are
    /// resolved against the working directory
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keyfile", &self.keyfile)
            .finish()
    }
}

/// Mapping pairs, each written as `"local:port,remote:port"`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MappingsConfig {
    /// Listen on the server, forward to the local side
    #[serde(default)]
    pub rtl: Vec<String>,

    /// Listen locally, forward to the server side
    #[serde(default)]
    pub ltr: Vec<String>,
}

/// Optional timing knobs, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelTuning {
    pub reconnect_backoff_secs: u64,
    pub full_sync_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub accept_failure_threshold: u32,
    pub strict_port_probe: bool,
    pub connect_timeout_secs: u64,
    /// 0 disables keepalives
    pub keepalive_interval_secs: u64,
}

impl Default for TunnelTuning {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: 10,
            full_sync_interval_secs: 10,
            retry_interval_secs: 5,
            accept_failure_threshold: 10,
            strict_port_probe: false,
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load the explicit path if given, otherwise discover in `work_dir`
    pub fn resolve(explicit: Option<&Path>, work_dir: &Path) -> Result<(PathBuf, Self)> {
        match explicit {
            Some(path) => {
                let path = if path.is_relative() {
                    work_dir.join(path)
                } else {
                    path.to_path_buf()
                };
                let config = Self::load(&path)?;
                Ok((path, config))
            }
            None => Self::discover_in(work_dir),
        }
    }

    /// Try each of [`CONFIG_FILE_NAMES`] in `dir`
    pub fn discover_in(dir: &Path) -> Result<(PathBuf, Self)> {
        let candidates: Vec<PathBuf> = CONFIG_FILE_NAMES.iter().map(|name| dir.join(name)).collect();

        for path in &candidates {
            if path.is_file() {
                let config = Self::load(path)?;
                return Ok((path.clone(), config));
            }
        }

        let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        anyhow::bail!("No configuration file found, tried: {}", tried.join(", "))
    }

    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            anyhow::bail!("server.addr must not be empty");
        }
        if self.server.user.trim().is_empty() {
            anyhow::bail!("server.user must not be empty");
        }
        self.server_endpoint()?;
        Ok(())
    }

    /// Server address with the default port filled in
    pub fn server_endpoint(&self) -> Result<Endpoint> {
        parse_server_addr(&self.server.addr)
            .with_context(|| format!("Invalid server address: {}", self.server.addr))
    }

    /// Valid mappings, remote-to-local first; malformed pairs are skipped with a warning
    pub fn mappings(&self) -> Vec<MappingSpec> {
        parse_mappings(&self.mappings.rtl, &self.mappings.ltr)
    }

    pub fn credentials(&self, work_dir: &Path) -> Credentials {
        let keyfile = self
            .server
            .keyfile
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| resolve_keyfile(p, work_dir));

        Credentials::new(keyfile, self.server.password.clone())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let tuning = &self.tunnel;
        SupervisorConfig {
            reconnect_backoff: Duration::from_secs(tuning.reconnect_backoff_secs),
            full_sync_interval: Duration::from_secs(tuning.full_sync_interval_secs),
            retry_interval: Duration::from_secs(tuning.retry_interval_secs),
            accept_failure_threshold: tuning.accept_failure_threshold,
            probe_policy: if tuning.strict_port_probe {
                ProbePolicy::Strict
            } else {
                ProbePolicy::Lenient
            },
        }
    }

    pub fn ssh_config(&self) -> Result<SshConfig> {
        let keepalive = match self.tunnel.keepalive_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(SshConfig::new(self.server_endpoint()?, self.server.user.clone())
            .with_connect_timeout(Duration::from_secs(self.tunnel.connect_timeout_secs))
            .with_keepalive(keepalive))
    }

    /// Write the starter configuration into `work_dir`, refusing to overwrite
    pub fn write_template(work_dir: &Path) -> Result<PathBuf> {
        let path = work_dir.join(CONFIG_FILE_NAMES[1]);
        if path.exists() {
            anyhow::bail!("Configuration already exists: {}", path.display());
        }
        std::fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create directory: {:?}", work_dir))?;
        std::fs::write(&path, Self::template())
            .with_context(|| format!("Failed to write configuration: {:?}", path))?;
        Ok(path)
    }

    /// Starter configuration file content
    pub fn template() -> String {
        r#"# autotun configuration
server:
  addr: example.com:22
  user: tunnel
  # password: secret
  keyfile: ~/.ssh/id_ed25519

mappings:
  # Remote-to-local: listen on the server, forward to this machine ("local,remote")
  rtl:
    - "127.0.0.1:22,0.0.0.0:2222"
  # Local-to-remote: listen here, forward to the server side ("local,remote")
  ltr: []
    # - "127.0.0.1:15432,10.0.0.5:5432"

# tunnel:
#   reconnect_backoff_secs: 10
#   full_sync_interval_secs: 10
#   retry_interval_secs: 5
#   accept_failure_threshold: 10
#   strict_port_probe: false
#   connect_timeout_secs: 30
#   keepalive_interval_secs: 30
"#
        .to_string()
    }
}

fn resolve_keyfile(path: &Path, work_dir: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_relative() {
        work_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Parse `host`, `host:port` or `[v6]:port`; the port defaults to 22
pub fn parse_server_addr(addr: &str) -> Result<Endpoint, EndpointParseError> {
    let addr = addr.trim();
    match addr.parse::<Endpoint>() {
        Ok(endpoint) => Ok(endpoint),
        Err(EndpointParseError::MissingPort(_)) => {
            let host = addr
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .unwrap_or(addr);
            if host.is_empty() {
                return Err(EndpointParseError::MissingHost(addr.to_string()));
            }
            Ok(Endpoint::new(host, DEFAULT_SSH_PORT))
        }
        Err(e) => Err(e),
    }
}
