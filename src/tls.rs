use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::config;

/// Subject name baked into generated certificates. Peers never check it.
const CERT_SUBJECT: &str = "airshare.local";

fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config::config_dir();
    (dir.join("server-cert.pem"), dir.join("server-key.pem"))
}

/// Server identity plus its fingerprint, loaded once at startup and shared.
pub struct ServerIdentity {
    pub config: Arc<rustls::ServerConfig>,
    pub fingerprint: String,
}

pub fn load_or_generate_server_config(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<ServerIdentity> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => default_server_cert_paths(),
        _ => return Err(anyhow!("tls_cert requires tls_key")),
    };

    if !cert_path.exists() || !key_path.exists() {
        generate_self_signed(&cert_path, &key_path)?;
    }

    let certs = {
        let mut rd = BufReader::new(fs::File::open(&cert_path).context("open cert")?);
        let mut out = Vec::new();
        for c in rustls_pemfile::certs(&mut rd) {
            out.push(c.context("read cert")?);
        }
        out
    };
    let leaf = certs.first().context("certificate file holds no certificate")?;
    let fingerprint = fingerprint(leaf);

    let key: PrivateKeyDer<'static> = {
        let mut rd = BufReader::new(fs::File::open(&key_path).context("open key")?);
        rustls_pemfile::private_key(&mut rd)
            .context("read key")?
            .context("key file holds no private key")?
    };

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(ServerIdentity { config: Arc::new(cfg), fingerprint })
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    let dir = cert_path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let cert = rcgen::generate_simple_self_signed(vec![CERT_SUBJECT.to_string()])
        .context("generate self-signed cert")?;
    config::write_private(cert_path, cert.serialize_pem().context("serialize cert")?.as_bytes())
        .context("write cert pem")?;
    config::write_private(key_path, cert.serialize_private_key_pem().as_bytes())
        .context("write key pem")?;
    tracing::info!(cert = %cert_path.display(), "generated self-signed transfer certificate");
    Ok(())
}

pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    hex::encode(h.finalize())
}

/// Accepts every peer certificate and handshake signature.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        tracing::trace!(fingerprint = %fingerprint(end_entity), "accepting peer certificate");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

pub fn build_client_config() -> Arc<rustls::ClientConfig> {
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Arc::new(cfg)
}

pub fn server_name_for(host: &str) -> ServerName<'static> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ServerName::IpAddress(ip.into());
    }
    match ServerName::try_from(host.to_string()) {
        Ok(name) => name,
        Err(_) => ServerName::IpAddress(IpAddr::from([127, 0, 0, 1]).into()),
    }
}
