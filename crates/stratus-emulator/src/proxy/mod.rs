//! HTTP proxy that answers emulated services, intercepting TLS with
//! minted per-host certificates.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and accept loop
//! - `handler` - CONNECT tunnels, CA download and request dispatch
//! - `certs` - CA material and leaf certificate minting
//! - `relay` - byte relay for tunnels that are not intercepted
//! - `network` - listener creation

mod certs;
mod context;
mod handler;
mod network;
mod relay;
mod server;

pub use certs::{
    is_valid_host, CaMaterial, CertificateError, CertificateStore, CA_CERT_FILE, CA_KEY_FILE,
    CERTS_DIR, LEAF_KEY_FILE,
};
pub use context::ProxyContext;
pub use handler::CA_DOWNLOAD_HOST;
pub use network::create_listener;
pub use relay::{relay, RelayStats};
pub use server::ProxyServer;
