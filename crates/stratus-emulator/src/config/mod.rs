//! Configuration types for the emulator and the proxy.

mod proxy;

pub use proxy::{ProxyConfig, DEFAULT_PROXY_PORT, PROXY_PORT_ENV, CA_DIR_ENV, DEFAULT_CA_DIR};

use crate::registry::DEFAULT_ACCOUNT_ID;
use serde::{Deserialize, Serialize};

/// Overrides the account id requests are dispatched under.
pub const ACCOUNT_ID_ENV: &str = "STRATUS_ACCOUNT_ID";

/// Credentials exported while the emulator is active.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StubCredentials {
    #[serde(default = "default_access_key_id")]
    pub access_key_id: String,
    #[serde(default = "default_secret_access_key")]
    pub secret_access_key: String,
}

fn default_access_key_id() -> String {
    "FOOBARKEY".to_string()
}

fn default_secret_access_key() -> String {
    "FOOBARSECRET".to_string()
}

impl Default for StubCredentials {
    fn default() -> Self {
        Self {
            access_key_id: default_access_key_id(),
            secret_access_key: default_secret_access_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EmulatorConfig {
    /// Account every dispatched request is attributed to.
    #[serde(default = "default_account_id")]
    pub account_id: String,

    #[serde(default)]
    pub credentials: StubCredentials,

    /// Export `credentials` into the process environment during activation.
    #[serde(default = "default_patch_env")]
    pub patch_env: bool,
}

fn default_account_id() -> String {
    DEFAULT_ACCOUNT_ID.to_string()
}

fn default_patch_env() -> bool {
    true
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            credentials: StubCredentials::default(),
            patch_env: default_patch_env(),
        }
    }
}

impl EmulatorConfig {
    /// Defaults with `STRATUS_ACCOUNT_ID` applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(account) = lookup(ACCOUNT_ID_ENV).filter(|v| !v.trim().is_empty()) {
            config.account_id = account.trim().to_string();
        }
        config
    }
}
