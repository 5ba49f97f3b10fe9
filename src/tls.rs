//! TLS material for listeners and connectors.
//!
//! Server side loads a PEM certificate chain and key, or generates a
//! self-signed certificate for `localhost` when none is configured. Client
//! side either relies on the webpki roots bundled with tokio-tungstenite or,
//! for self-signed peers, skips certificate verification entirely.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tracing::{info, warn};

use crate::config::TlsCertificateFiles;
use crate::error::TransportError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Install ring as the process-wide provider for configs built without an
/// explicit one (tungstenite's verified client path). No-op when one is set.
pub(crate) fn install_default_provider() {
    if CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
}

/// Build the rustls server config for a listener.
///
/// # Errors
///
/// Returns [`TransportError::Tls`] when files cannot be read or parsed, or
/// certificate generation fails.
pub fn server_config(files: Option<&TlsCertificateFiles>) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    let (chain, key) = match files {
        Some(files) => load_pem(files)?,
        None => self_signed()?,
    };

    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn load_pem(files: &TlsCertificateFiles) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let chain = rustls_pemfile::certs(&mut open(&files.cert)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("invalid certificate {}: {e}", files.cert.display())))?;
    if chain.is_empty() {
        return Err(TransportError::Tls(format!("no certificate found in {}", files.cert.display())));
    }

    let key = rustls_pemfile::private_key(&mut open(&files.key)?)
        .map_err(|e| TransportError::Tls(format!("invalid private key {}: {e}", files.key.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", files.key.display())))?;

    info!(cert = %files.cert.display(), "tls: loaded certificate");
    Ok((chain, key))
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {e}", path.display())))
}

/// Generate a throwaway certificate for `localhost`.
fn self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])?;
    warn!("tls: no certificate configured, using a generated self-signed certificate");
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok((vec![certified.cert.der().clone()], PrivateKeyDer::Pkcs8(key)))
}

/// Client config that accepts any server certificate.
///
/// # Errors
///
/// Returns [`TransportError::Tls`] when the crypto provider rejects the
/// default protocol versions.
pub fn insecure_client_config() -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let verifier = Arc::new(AcceptAnyCertificate(provider()));
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_certificate_builds_server_config() {
        let config = server_config(None).expect("self-signed config");
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn missing_certificate_file_is_tls_error() {
        let files = TlsCertificateFiles { cert: "/nonexistent/cert.pem".into(), key: "/nonexistent/key.pem".into() };
        let err = server_config(Some(&files)).expect_err("missing files should fail");
        assert!(matches!(err, TransportError::Tls(msg) if msg.contains("cert.pem")));
    }

    #[test]
    fn insecure_client_config_builds() {
        let config = insecure_client_config().expect("client config");
        assert!(config.alpn_protocols.is_empty());
    }
}
