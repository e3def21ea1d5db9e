//! stratus-proxy: serve the emulator as an HTTP(S) proxy.
//!
//! # Usage
//!
//! ```bash
//! # Listen on 127.0.0.1:5005 (or $MOTO_PROXY_PORT)
//! stratus-proxy
//!
//! # Intercept TLS using the CA material in ./certs-dir
//! stratus-proxy -H 0.0.0.0 -p 5005 --ca-dir ./certs-dir
//!
//! # Load extension scripts, earlier files run first
//! stratus-proxy --extension audit.rhai --extension throttle.rhai
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use stratus_emulator::config::{CA_DIR_ENV, PROXY_PORT_ENV};
use stratus_emulator::{Emulator, ProxyConfig, ProxyServer};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "stratus-proxy")]
#[command(author, version, about = "HTTP(S) proxy answering emulated cloud APIs")]
struct Args {
    /// Address to listen on
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = PROXY_PORT_ENV)]
    port: Option<u16>,

    /// YAML file with proxy settings; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory with ca.crt, ca.key, cert.key and certs/
    #[arg(long, env = CA_DIR_ENV)]
    ca_dir: Option<PathBuf>,

    /// Close relayed tunnels after this many idle seconds
    #[arg(long)]
    relay_timeout_secs: Option<u64>,

    /// Extension script to load (repeatable)
    #[arg(long = "extension")]
    extensions: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

fn proxy_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.ca_dir {
        config.ca_dir = dir.clone();
    }
    if let Some(secs) = args.relay_timeout_secs {
        config.relay_idle_timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let config = proxy_config(&args)?;
    let emulator = Emulator::global();
    for (priority, path) in args.extensions.iter().enumerate() {
        let ids = emulator
            .load_extensions(path, priority as i32)
            .with_context(|| format!("Failed to load extensions from {}", path.display()))?;
        info!("Loaded extensions {:?} from {}", ids, path.display());
    }

    let server = ProxyServer::new(config, emulator)?;
    let listener = server.bind()?;

    tokio::select! {
        result = server.serve(listener) => result,
        _ = shutdown_signal() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
