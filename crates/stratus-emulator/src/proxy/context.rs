use super::certs::CertificateStore;
use crate::config::ProxyConfig;
use crate::emulator::Emulator;
use std::sync::Arc;
use std::time::Duration;

/// State shared by every connection the proxy serves.
pub struct ProxyContext {
    pub emulator: Arc<Emulator>,
    /// `None` means CONNECT tunnels are relayed instead of intercepted.
    pub certs: Option<Arc<CertificateStore>>,
    pub relay_idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProxyContext {
    pub fn new(
        config: &ProxyConfig,
        emulator: Arc<Emulator>,
        certs: Option<Arc<CertificateStore>>,
    ) -> Self {
        Self {
            emulator,
            certs,
            relay_idle_timeout: config.relay_idle_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn is_intercepting(&self) -> bool {
        self.certs.is_some()
    }
}
