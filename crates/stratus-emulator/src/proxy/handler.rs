//! Per-request handling: CONNECT tunnels, the CA download and plain
//! absolute-form requests.

use super::context::ProxyContext;
use super::relay::relay;
use crate::dispatcher::IncomingRequest;
use crate::metrics;
use crate::wire::{encode_response, ErrorResponseBuilder};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Plain-HTTP host that serves the CA certificate.
pub const CA_DOWNLOAD_HOST: &str = "proxy2.test";
const DEFAULT_TUNNEL_PORT: u16 = 443;

pub async fn handle_request(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(ctx, req).await);
    }

    if req.uri().host() == Some(CA_DOWNLOAD_HOST) {
        return Ok(ca_certificate_response(&ctx));
    }

    let fallback = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    Ok(dispatch_to_emulator(&ctx, req, "http", &fallback).await)
}

fn connection_established() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

fn bad_gateway(message: impl Into<Bytes>) -> Response<Full<Bytes>> {
    ErrorResponseBuilder::new(StatusCode::BAD_GATEWAY)
        .body(message)
        .header("Content-Type", "text/plain")
        .build_full()
}

fn ca_certificate_response(ctx: &ProxyContext) -> Response<Full<Bytes>> {
    match &ctx.certs {
        Some(store) => ErrorResponseBuilder::new(StatusCode::OK)
            .body(store.ca_cert_pem())
            .header("Content-Type", "application/x-x509-ca-cert")
            .header("Connection", "close")
            .build_full(),
        None => ErrorResponseBuilder::new(StatusCode::NOT_FOUND)
            .body("No CA configured")
            .header("Connection", "close")
            .build_full(),
    }
}

async fn handle_connect(ctx: Arc<ProxyContext>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(authority) = req.uri().authority().cloned() else {
        return ErrorResponseBuilder::new(StatusCode::BAD_REQUEST)
            .body("CONNECT requires host:port")
            .build_full();
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(DEFAULT_TUNNEL_PORT);

    match ctx.certs.clone() {
        Some(store) => {
            let tls_host = host.clone();
            let config =
                match tokio::task::spawn_blocking(move || store.server_config(&tls_host)).await {
                    Ok(Ok(config)) => config,
                    Ok(Err(e)) => {
                        warn!("No certificate for {}: {}", host, e);
                        return bad_gateway(format!("Certificate unavailable for {host}"));
                    }
                    Err(e) => {
                        error!("Certificate task for {} failed: {}", host, e);
                        return bad_gateway("Certificate task failed");
                    }
                };

            let authority = if port == DEFAULT_TUNNEL_PORT {
                host.clone()
            } else {
                format!("{host}:{port}")
            };
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => serve_intercepted(ctx, upgraded, config, authority).await,
                    Err(e) => debug!("CONNECT upgrade for {} failed: {}", host, e),
                }
            });
            metrics::record_tunnel("intercept");
            connection_established()
        }
        None => {
            let connect = TcpStream::connect((host.as_str(), port));
            let mut origin = match tokio::time::timeout(ctx.connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("Connecting to {}:{} failed: {}", host, port, e);
                    return bad_gateway(format!("Cannot reach {host}:{port}"));
                }
                Err(_) => {
                    warn!("Connecting to {}:{} timed out", host, port);
                    return bad_gateway(format!("Timed out reaching {host}:{port}"));
                }
            };

            let idle_timeout = ctx.relay_idle_timeout;
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        let mut client = TokioIo::new(upgraded);
                        match relay(&mut client, &mut origin, idle_timeout).await {
                            Ok(stats) => debug!(
                                "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
                                host, port, stats.client_to_origin, stats.origin_to_client
                            ),
                            Err(e) => debug!("Tunnel to {}:{} ended: {}", host, port, e),
                        }
                    }
                    Err(e) => debug!("CONNECT upgrade for {} failed: {}", host, e),
                }
            });
            metrics::record_tunnel("relay");
            connection_established()
        }
    }
}

/// Terminate TLS on the upgraded tunnel and answer its requests from the
/// emulator, one at a time.
async fn serve_intercepted(
    ctx: Arc<ProxyContext>,
    upgraded: Upgraded,
    config: Arc<ServerConfig>,
    authority: String,
) {
    let acceptor = TlsAcceptor::from(config);
    let tls = match acceptor.accept(TokioIo::new(upgraded)).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!("TLS handshake for {} failed: {}", authority, e);
            return;
        }
    };

    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        let authority = authority.clone();
        async move { Ok::<_, Infallible>(dispatch_to_emulator(&ctx, req, "https", &authority).await) }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .await
    {
        log_connection_error("intercepted", &e);
    }
}

/// `scheme://Host/path`, using `fallback_authority` when the request has
/// no Host header.
fn full_url<B>(req: &Request<B>, scheme: &str, fallback_authority: &str) -> String {
    let uri = req.uri();
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(fallback_authority);
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{scheme}://{host}{path}")
}

async fn dispatch_to_emulator(
    ctx: &ProxyContext,
    req: Request<Incoming>,
    scheme: &str,
    fallback_authority: &str,
) -> Response<Full<Bytes>> {
    let url = full_url(&req, scheme, fallback_authority);
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Reading body of {} {} failed: {}", parts.method, url, e);
            return ErrorResponseBuilder::new(StatusCode::BAD_REQUEST).build_full();
        }
    };

    debug!("Proxy dispatch {} {}", parts.method, url);
    let request = IncomingRequest::from_parts(&parts, url.clone(), body);
    // handlers and script hooks are synchronous and may be slow
    let emulator = Arc::clone(&ctx.emulator);
    match tokio::task::spawn_blocking(move || emulator.dispatch(request)).await {
        Ok(Ok(response)) => encode_response(response),
        Ok(Err(e)) => {
            warn!("Dispatch of {} {} failed: {}", parts.method, url, e);
            bad_gateway(e.to_string())
        }
        Err(e) if e.is_panic() => {
            error!("Handler panicked on {} {}", parts.method, url);
            bad_gateway("Handler panicked")
        }
        Err(e) => {
            error!("Dispatch task for {} {} failed: {}", parts.method, url, e);
            bad_gateway("Dispatch task failed")
        }
    }
}

fn is_client_disconnect(err: &hyper::Error) -> bool {
    if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

pub(crate) fn log_connection_error(kind: &str, err: &hyper::Error) {
    if is_client_disconnect(err) {
        debug!("Client closed {} connection: {}", kind, err);
    } else {
        info!("Error serving {} connection: {}", kind, err);
    }
}
