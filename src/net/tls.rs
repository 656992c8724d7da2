//! TLS policy and the persisted self-signed keypair.
//!
//! Transport TLS here only hides traffic from path observers; peers are
//! authenticated by the p2p handshake, so outbound connections accept any
//! certificate. An auto-generated keypair is written next to the data dir
//! and reused across restarts.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

pub const CERT_FILE: &str = "rpc_ssl.crt";
pub const KEY_FILE: &str = "rpc_ssl.key";

/// First byte of a TLS ClientHello record
pub const TLS_HANDSHAKE_BYTE: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    /// Plaintext only
    Disabled,
    /// Accept both; inbound peeks the first byte, outbound stays plain
    Autodetect,
    /// TLS required in both directions
    Enabled,
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(SslMode::Disabled),
            "autodetect" => Ok(SslMode::Autodetect),
            "enabled" => Ok(SslMode::Enabled),
            other => Err(format!("unknown ssl mode: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls io error: {0}")]
    Io(#[from] io::Error),
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("tls configuration failed: {0}")]
    Config(#[from] rustls::Error),
    #[error("no usable private key in {0}")]
    BadKey(String),
}

/// Shared acceptor/connector pair built from the persisted keypair
#[derive(Clone)]
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl TlsContext {
    pub fn init(data_dir: &Path) -> Result<Self, TlsError> {
        let (certs, key) = load_or_generate_keypair(data_dir)?;

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }
}

/// Load the persisted PEM pair, generating and writing a fresh one when
/// either file is missing or unreadable.
fn load_or_generate_keypair(
    data_dir: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert_path = data_dir.join(CERT_FILE);
    let key_path = data_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        match load_keypair(&cert_path, &key_path) {
            Ok(pair) => return Ok(pair),
            Err(err) => info!("regenerating tls keypair: {err}"),
        }
    }

    let certified = rcgen::generate_simple_self_signed(vec!["nocturne".to_string()])?;
    let cert_pem = certified.cert.pem();
    let key_pem = certified.key_pair.serialize_pem();

    fs::create_dir_all(data_dir)?;
    fs::write(&cert_path, &cert_pem)?;
    fs::write(&key_path, &key_pem)?;
    info!("generated tls keypair at {}", cert_path.display());

    load_keypair(&cert_path, &key_path)
}

fn load_keypair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert_bytes = fs::read(cert_path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_bytes.as_slice()).collect::<Result<_, _>>()?;

    let key_bytes = fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
        .ok_or_else(|| TlsError::BadKey(key_path.display().to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::BadKey(cert_path.display().to_string()));
    }
    Ok((certs, key))
}

/// Certificate chains from peers are self-signed throwaways; only the
/// signature over the handshake itself is checked.
#[derive(Debug)]
struct AcceptAnyCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            schemes: aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
