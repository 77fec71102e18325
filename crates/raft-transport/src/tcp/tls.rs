//! TLS setup for the tcp binding.
//!
//! The server uses the configured PEM files or a freshly generated
//! self-signed certificate. The client trusts `ca_path` when given and
//! otherwise accepts whatever certificate the peer presents.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use super::TcpConfig;
use crate::{ProtocolError, Result};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Tls(e.to_string())
}

/// Build the acceptor for incoming connections
pub fn acceptor(config: &TcpConfig) -> Result<TlsAcceptor> {
    let (certs, key) = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            debug!(cert = %cert_path.display(), "loading tls certificate");
            (load_certs(cert_path)?, load_private_key(key_path)?)
        }
        _ => self_signed(&config.host)?,
    };

    let server_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProtocolError::Tls(format!("TLS configuration error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Build the connector for outgoing connections
pub fn connector(config: &TcpConfig) -> Result<TlsConnector> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let client_config = match &config.ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| ProtocolError::Tls(format!("Invalid CA certificate: {}", e)))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::new()))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// The name presented for SNI and certificate checks: the host part of `target`
pub fn server_name(target: &str) -> Result<ServerName<'static>> {
    let host = match target.rsplit_once(':') {
        Some((host, _port)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => target,
    };
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| ProtocolError::Tls(format!("invalid server name {host:?}: {e}")))
}

fn self_signed(host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let names = vec!["localhost".to_string(), host.to_string()];
    let certified = rcgen::generate_simple_self_signed(names).map_err(tls_error)?;
    info!(host, "generated self-signed tls certificate");

    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok((vec![cert], key))
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ProtocolError::Tls(format!("Failed to open certificate file {:?}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProtocolError::Tls(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(ProtocolError::Tls(format!(
            "No certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ProtocolError::Tls(format!("Failed to open private key file {:?}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProtocolError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| ProtocolError::Tls(format!("No private key found in {:?}", path)))
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyCertificate {
    fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
