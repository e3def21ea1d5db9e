//! The proxy over real sockets: CA download, TLS interception, certificate
//! reuse and relayed tunnels.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stratus_emulator::proxy::{CaMaterial, CERTS_DIR};
use stratus_emulator::{
    Backend, EmulatorConfig, Emulator, HandlerResult, ProxyConfig, ProxyServer, RegionScope,
    RouteTable, ServiceDescriptor, ServiceRequest, ServiceResponse,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Svc1 {
    routes: RouteTable,
}

impl Backend for Svc1 {
    fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn reset(&self) {}
}

fn emulator() -> Arc<Emulator> {
    let emulator = Emulator::new(EmulatorConfig::default());
    emulator
        .register_service(
            ServiceDescriptor::new("svc1", RegionScope::Global, |_: &str, _: &str| {
                Ok(Svc1 {
                    routes: RouteTable::new([r"^https?://svc1\.example\.com"])
                        .route("/ping$", "Ping", |_: &ServiceRequest| -> HandlerResult {
                            Ok(ServiceResponse::ok("pong").with_header("X", "y"))
                        })?
                        .route("/fail$", "Fail", |_: &ServiceRequest| -> HandlerResult {
                            Err(anyhow::anyhow!("backend bug").into())
                        })?
                        .route("/slow$", "Slow", |_: &ServiceRequest| -> HandlerResult {
                            std::thread::sleep(Duration::from_millis(500));
                            Ok(ServiceResponse::ok("slow"))
                        })?,
                })
            })
            .url_base(r"^https?://svc1\.example\.com")
            .operations(["Ping", "Fail", "Slow"]),
        )
        .unwrap();
    emulator
}

async fn start_proxy(ca_dir: &Path) -> SocketAddr {
    let config = ProxyConfig {
        port: 0,
        ca_dir: ca_dir.to_path_buf(),
        relay_idle_timeout_secs: 1,
        ..Default::default()
    };
    let server = ProxyServer::new(config, emulator()).unwrap();
    let listener = server.bind().unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    addr
}

/// Send a CONNECT and return the response head.
async fn connect(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "proxy closed before answering CONNECT");
        head.push(byte[0]);
    }
    (stream, String::from_utf8(head).unwrap())
}

fn client_via(proxy: SocketAddr, ca_pem: Option<&[u8]>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).unwrap())
        .timeout(Duration::from_secs(10));
    if let Some(pem) = ca_pem {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem).unwrap());
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_ca_certificate_download() {
    let dir = TempDir::new().unwrap();
    let material = CaMaterial::generate(dir.path()).unwrap();
    let proxy = start_proxy(dir.path()).await;

    let response = client_via(proxy, None)
        .get("http://proxy2.test/")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-x509-ca-cert"
    );
    assert_eq!(response.headers()["connection"], "close");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), std::fs::read(material.ca_cert_path()).unwrap());
}

#[tokio::test]
async fn test_intercepted_https_request() {
    let dir = TempDir::new().unwrap();
    let material = CaMaterial::generate(dir.path()).unwrap();
    let ca_pem = std::fs::read(material.ca_cert_path()).unwrap();
    let proxy = start_proxy(dir.path()).await;
    let client = client_via(proxy, Some(&ca_pem));

    let response = client
        .get("https://svc1.example.com/ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x"], "y");
    assert_eq!(response.headers()["content-length"], "4");
    assert_eq!(response.text().await.unwrap(), "pong");

    let missing = client
        .get("https://svc1.example.com/nothing")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    assert_eq!(missing.text().await.unwrap(), "Not yet implemented");

    let failed = client
        .get("https://svc1.example.com/fail")
        .send()
        .await
        .unwrap();
    assert_eq!(failed.status(), 502);

    assert!(dir.path().join(CERTS_DIR).join("svc1.example.com.crt").is_file());
}

#[tokio::test]
async fn test_plain_http_request_is_dispatched() {
    let dir = TempDir::new().unwrap();
    let proxy = start_proxy(dir.path()).await;

    let response = client_via(proxy, None)
        .get("http://svc1.example.com/ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "pong");
}

#[tokio::test]
async fn test_slow_handler_does_not_block_other_connections() {
    let dir = TempDir::new().unwrap();
    let proxy = start_proxy(dir.path()).await;
    let client = client_via(proxy, None);

    let slow = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .get("http://svc1.example.com/slow")
                .send()
                .await
                .unwrap()
                .status()
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = client
        .get("http://svc1.example.com/ping")
        .send()
        .await
        .unwrap();
    assert_eq!(fast.status(), 200);
    assert!(!slow.is_finished());
    assert_eq!(slow.await.unwrap(), 200);
}

#[tokio::test]
async fn test_non_utf8_header_is_bad_gateway() {
    let dir = TempDir::new().unwrap();
    let proxy = start_proxy(dir.path()).await;

    let value = reqwest::header::HeaderValue::from_bytes(&[0xff]).unwrap();
    let response = client_via(proxy, None)
        .get("http://svc1.example.com/ping")
        .header("X-Bad", value)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_certificate_minted_once_per_host() {
    let dir = TempDir::new().unwrap();
    CaMaterial::generate(dir.path()).unwrap();
    let proxy = start_proxy(dir.path()).await;
    let cert = dir.path().join(CERTS_DIR).join("example.com.crt");

    let (_first, head) = connect(proxy, "example.com:443").await;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{head}");
    let contents = std::fs::read(&cert).unwrap();
    let modified = std::fs::metadata(&cert).unwrap().modified().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let (_second, head) = connect(proxy, "example.com:443").await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(std::fs::read(&cert).unwrap(), contents);
    assert_eq!(std::fs::metadata(&cert).unwrap().modified().unwrap(), modified);

    let entries = std::fs::read_dir(dir.path().join(CERTS_DIR)).unwrap().count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_certificate() {
    let dir = TempDir::new().unwrap();
    CaMaterial::generate(dir.path()).unwrap();
    let proxy = start_proxy(dir.path()).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| tokio::spawn(async move { connect(proxy, "race.example.com:443").await.1 }))
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().starts_with("HTTP/1.1 200"));
    }

    let entries: Vec<_> = std::fs::read_dir(dir.path().join(CERTS_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec!["race.example.com.crt".to_string()]);
}

#[tokio::test]
async fn test_relay_without_ca_material() {
    let dir = TempDir::new().unwrap();
    let proxy = start_proxy(dir.path()).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
    });

    let (mut tunnel, head) = connect(proxy, &origin_addr.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    tunnel.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    assert!(!dir.path().join(CERTS_DIR).exists());
}

#[tokio::test]
async fn test_relay_to_unreachable_origin_is_bad_gateway() {
    let dir = TempDir::new().unwrap();
    let proxy = start_proxy(dir.path()).await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let (_stream, head) = connect(proxy, &closed_addr.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
}
