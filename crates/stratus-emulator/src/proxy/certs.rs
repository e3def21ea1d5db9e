//! CA material and per-host leaf certificates for TLS interception.
//!
//! The CA directory layout is:
//!
//! ```text
//! ca/
//!   ca.crt        CA certificate (served at http://proxy2.test/)
//!   ca.key        CA signing key
//!   cert.key      key shared by every leaf certificate
//!   certs/        one <host>.crt per intercepted host
//! ```
//!
//! Leaves are minted on first use and reused from disk afterwards. Minting
//! is serialised by a single lock so concurrent CONNECTs for the same host
//! produce exactly one file.

use crate::metrics;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const LEAF_KEY_FILE: &str = "cert.key";
pub const CERTS_DIR: &str = "certs";

const VALIDITY: Duration = Duration::from_secs(3650 * 24 * 60 * 60);
const CA_COMMON_NAME: &str = "Stratus Emulator CA";
const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Invalid host name '{0}'")]
    InvalidHost(String),

    #[error("CA material incomplete in {}", .0.display())]
    MissingMaterial(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificate found in {}", .0.display())]
    NoCertificate(PathBuf),

    #[error("No private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("RSA key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("RSA key encoding failed: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CertificateError + '_ {
    move |source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Paths of the CA material inside a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterial {
    dir: PathBuf,
}

impl CaMaterial {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILE)
    }

    pub fn leaf_key_path(&self) -> PathBuf {
        self.dir.join(LEAF_KEY_FILE)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.dir.join(CERTS_DIR)
    }

    /// Interception is possible only when all four entries exist.
    pub fn is_complete(&self) -> bool {
        self.ca_cert_path().is_file()
            && self.ca_key_path().is_file()
            && self.leaf_key_path().is_file()
            && self.certs_dir().is_dir()
    }

    /// Write a fresh self-signed CA and leaf key into `dir`.
    pub fn generate(dir: impl AsRef<Path>) -> Result<Self, CertificateError> {
        let material = Self::new(dir);
        let certs_dir = material.certs_dir();
        fs::create_dir_all(&certs_dir).map_err(io_error(&certs_dir))?;

        let ca_key = generate_rsa_key()?;
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = SystemTime::now();
        params.not_before = (now - Duration::from_secs(24 * 60 * 60)).into();
        params.not_after = (now + VALIDITY).into();
        let ca_cert = params.self_signed(&ca_key)?;

        let leaf_key = generate_rsa_key()?;

        write_file(&material.ca_cert_path(), ca_cert.pem().as_bytes())?;
        write_file(&material.ca_key_path(), ca_key.serialize_pem().as_bytes())?;
        write_file(&material.leaf_key_path(), leaf_key.serialize_pem().as_bytes())?;
        info!("Generated CA material in {}", material.dir.display());
        Ok(material)
    }
}

/// Fresh RSA key as an rcgen signing key (PKCS#8, SHA-256 signatures).
fn generate_rsa_key() -> Result<KeyPair, CertificateError> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)?;
    let pem = key.to_pkcs8_pem(LineEnding::LF)?;
    Ok(KeyPair::from_pkcs8_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)?)
}

fn read_file(path: &Path) -> Result<Vec<u8>, CertificateError> {
    fs::read(path).map_err(io_error(path))
}

fn read_string(path: &Path) -> Result<String, CertificateError> {
    fs::read_to_string(path).map_err(io_error(path))
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(io_error(path))
}

/// Host names that are safe to use as a file name and a certificate SAN.
pub fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('.')
        && !host.contains("..")
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Loaded CA material plus the minted leaf cache.
pub struct CertificateStore {
    material: CaMaterial,
    ca_cert_pem: Bytes,
    ca_cert_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
    leaf_key: KeyPair,
    leaf_key_der: PrivateKeyDer<'static>,
    mint_lock: Mutex<()>,
    last_serial: AtomicU64,
    configs: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateStore {
    pub fn load(material: CaMaterial) -> Result<Self, CertificateError> {
        if !material.is_complete() {
            return Err(CertificateError::MissingMaterial(material.dir.clone()));
        }

        let ca_cert_path = material.ca_cert_path();
        let ca_cert_bytes = read_file(&ca_cert_path)?;
        let ca_cert_pem = String::from_utf8_lossy(&ca_cert_bytes).into_owned();
        let ca_cert_der = rustls_pemfile::certs(&mut ca_cert_bytes.as_slice())
            .next()
            .transpose()
            .map_err(io_error(&ca_cert_path))?
            .ok_or_else(|| CertificateError::NoCertificate(ca_cert_path.clone()))?;

        let ca_key = KeyPair::from_pem(&read_string(&material.ca_key_path())?)?;
        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, ca_key)?;

        let leaf_key_path = material.leaf_key_path();
        let leaf_key_pem = read_string(&leaf_key_path)?;
        let leaf_key = KeyPair::from_pem(&leaf_key_pem)?;
        let leaf_key_der = rustls_pemfile::private_key(&mut leaf_key_pem.as_bytes())
            .map_err(io_error(&leaf_key_path))?
            .ok_or_else(|| CertificateError::NoPrivateKey(leaf_key_path.clone()))?;

        debug!("Loaded CA material from {}", material.dir.display());
        Ok(Self {
            material,
            ca_cert_pem: Bytes::from(ca_cert_bytes),
            ca_cert_der,
            issuer,
            leaf_key,
            leaf_key_der,
            mint_lock: Mutex::new(()),
            last_serial: AtomicU64::new(0),
            configs: RwLock::new(HashMap::new()),
        })
    }

    pub fn material(&self) -> &CaMaterial {
        &self.material
    }

    /// `ca.crt` exactly as it is on disk.
    pub fn ca_cert_pem(&self) -> Bytes {
        self.ca_cert_pem.clone()
    }

    pub fn cert_path(&self, host: &str) -> PathBuf {
        self.material.certs_dir().join(format!("{host}.crt"))
    }

    /// Path of the leaf for `host`, minting it if it is not on disk yet.
    /// An existing file is never rewritten.
    pub fn leaf_certificate(&self, host: &str) -> Result<PathBuf, CertificateError> {
        if !is_valid_host(host) {
            return Err(CertificateError::InvalidHost(host.to_string()));
        }
        let path = self.cert_path(host);
        if path.is_file() {
            return Ok(path);
        }

        let _guard = self.mint_lock.lock();
        if path.is_file() {
            return Ok(path);
        }
        let pem = self.mint(host)?;

        let tmp = path.with_extension("crt.tmp");
        write_file(&tmp, pem.as_bytes())?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        metrics::record_certificate_minted();
        info!("Minted certificate for {}", host);
        Ok(path)
    }

    fn mint(&self, host: &str) -> Result<String, CertificateError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, host);
        params.distinguished_name = name;
        params.serial_number = Some(serial_number(self.next_serial()));
        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + VALIDITY).into();
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params.signed_by(&self.leaf_key, &self.issuer)?;
        Ok(cert.pem())
    }

    /// Millisecond epoch, bumped past the previous serial when two mints
    /// land in the same millisecond.
    fn next_serial(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let previous = self
            .last_serial
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    /// TLS server configuration presenting the leaf for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CertificateError> {
        if let Some(config) = self.configs.read().get(host) {
            return Ok(Arc::clone(config));
        }

        let path = self.leaf_certificate(host)?;
        let leaf_pem = read_file(&path)?;
        let leaf = rustls_pemfile::certs(&mut leaf_pem.as_slice())
            .next()
            .transpose()
            .map_err(io_error(&path))?
            .ok_or_else(|| CertificateError::NoCertificate(path.clone()))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![leaf, self.ca_cert_der.clone()], self.leaf_key_der.clone_key())?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.configs
            .write()
            .insert(host.to_string(), Arc::clone(&config));
        Ok(config)
    }
}

fn serial_number(serial: u64) -> SerialNumber {
    let bytes = serial.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    SerialNumber::from_slice(&bytes[first..])
}
