//! ProxyServer struct and accept loop.

use super::certs::{CaMaterial, CertificateStore};
use super::context::ProxyContext;
use super::handler::{handle_request, log_connection_error};
use super::network::create_listener;
use crate::config::ProxyConfig;
use crate::emulator::Emulator;
use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct ProxyServer {
    config: ProxyConfig,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    /// Build a server; loads CA material from `config.ca_dir` when it is
    /// complete, otherwise CONNECT tunnels are relayed.
    pub fn new(config: ProxyConfig, emulator: Arc<Emulator>) -> Result<Self, anyhow::Error> {
        config.validate()?;
        let material = CaMaterial::new(&config.ca_dir);
        let certs = if material.is_complete() {
            let store = CertificateStore::load(material).with_context(|| {
                format!("Failed to load CA material from {}", config.ca_dir.display())
            })?;
            Some(Arc::new(store))
        } else {
            info!(
                "No CA material in {}, CONNECT tunnels will be relayed",
                config.ca_dir.display()
            );
            None
        };

        let ctx = Arc::new(ProxyContext::new(&config, emulator, certs));
        Ok(Self { config, ctx })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn is_intercepting(&self) -> bool {
        self.ctx.is_intercepting()
    }

    pub fn bind(&self) -> Result<TcpListener, anyhow::Error> {
        let addr = self.config.addr()?;
        create_listener(addr).with_context(|| format!("Failed to bind proxy to {addr}"))
    }

    /// Bind to the configured address and serve until the task is dropped.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        let addr: SocketAddr = listener.local_addr()?;
        info!("Proxy listening on http://{}", addr);
        if self.is_intercepting() {
            info!("TLS interception enabled (CA at http://proxy2.test/)");
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| handle_request(Arc::clone(&ctx), req));

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    log_connection_error(&remote_addr.to_string(), &err);
                }
            });
        }
    }
}
