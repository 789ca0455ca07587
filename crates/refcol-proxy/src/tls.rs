//! TLS transport for `grpcs://` backends.
//!
//! Backends are reached with TLS but without peer certificate verification;
//! handshake signatures are still checked against the crypto provider.

use std::sync::Arc;

use hyper_util::rt::TokioIo;
use refcol_core::{BackendError, BackendResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Build a client config that accepts any server certificate and speaks h2
pub(crate) fn insecure_client_config() -> BackendResult<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| BackendError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}

/// Resolve the SNI name for a backend host
pub(crate) fn server_name(host: &str) -> BackendResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| BackendError::Tls(format!("invalid server name {host:?}: {e}")))
}

/// Dial `authority` and run the TLS handshake
pub(crate) async fn connect_tls(
    config: Arc<ClientConfig>,
    authority: String,
    server_name: ServerName<'static>,
) -> std::io::Result<TokioIo<TlsStream<TcpStream>>> {
    let tcp = TcpStream::connect(&authority).await?;
    tcp.set_nodelay(true)?;
    let stream = TlsConnector::from(config).connect(server_name, tcp).await?;
    Ok(TokioIo::new(stream))
}

/// Certificate verifier that trusts every peer
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self(provider)
    }
}

impl ServerCertVerifier for SkipServerVerification {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_negotiates_h2() {
        let config = insecure_client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn verifier_accepts_any_certificate() {
        let verifier =
            SkipServerVerification::new(Arc::new(rustls::crypto::ring::default_provider()));
        let cert = CertificateDer::from(vec![0u8; 8]);
        let name = ServerName::try_from("backend.internal").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn server_name_accepts_hosts_and_ips() {
        assert!(server_name("backend.internal").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
    }
}
