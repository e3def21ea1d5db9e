//! Proxy listener and certificate settings.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROXY_PORT_ENV: &str = "MOTO_PROXY_PORT";
pub const CA_DIR_ENV: &str = "STRATUS_CA_DIR";
pub const DEFAULT_PROXY_PORT: u16 = 5005;
pub const DEFAULT_CA_DIR: &str = "ca";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding `ca.crt`, `ca.key`, `cert.key` and `certs/`.
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,

    /// Relay tunnels close after this long without traffic.
    #[serde(default = "default_relay_idle_timeout_secs")]
    pub relay_idle_timeout_secs: u64,

    /// Timeout for connecting to the origin in relay mode.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CA_DIR)
}

fn default_relay_idle_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ca_dir: default_ca_dir(),
            relay_idle_timeout_secs: default_relay_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ProxyConfig {
    /// Defaults with `MOTO_PROXY_PORT` and `STRATUS_CA_DIR` applied.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, anyhow::Error> {
        let mut config = Self::default();
        if let Some(port) = lookup(PROXY_PORT_ENV) {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} is not a valid port: {:?}", PROXY_PORT_ENV, port))?;
        }
        if let Some(dir) = lookup(CA_DIR_ENV).filter(|v| !v.is_empty()) {
            config.ca_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read proxy config {}", path.display()))?;
        let config: ProxyConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.host.trim().is_empty() {
            anyhow::bail!("Proxy host must not be empty");
        }
        if self.relay_idle_timeout_secs == 0 {
            anyhow::bail!("relay_idle_timeout_secs must be greater than zero");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Resolve `host:port` to a bindable address.
    pub fn addr(&self) -> Result<SocketAddr, anyhow::Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}:{}", self.host, self.port))?
            .next()
            .with_context(|| format!("No address found for {}:{}", self.host, self.port))
    }

    pub fn relay_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
