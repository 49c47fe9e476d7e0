//! TLS client used by the session layer.
//!
//! Certificate and hostname verification are disabled: the session probe only
//! needs to know whether the peer completes a handshake, not whether it can be
//! trusted.
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::ProbeError;

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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

static CLIENT_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();

/// Shared client configuration, built on first use.
pub fn client_config() -> Result<Arc<ClientConfig>, ProbeError> {
    CLIENT_CONFIG
        .get_or_try_init(|| {
            let provider = Arc::new(ring::default_provider());
            let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
                .with_safe_default_protocol_versions()
                .map_err(|e| ProbeError::Tls(e.to_string()))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth();
            Ok(Arc::new(config))
        })
        .cloned()
}

/// Runs a client handshake over an established TCP stream.
pub async fn handshake(
    stream: TcpStream,
    host: &str,
) -> Result<TlsStream<TcpStream>, ProbeError> {
    let config = client_config()?;
    let server_name =
        ServerName::try_from(host.to_owned()).map_err(|e| ProbeError::Tls(e.to_string()))?;

    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| ProbeError::Tls(e.to_string()))
}

/// Negotiated protocol version and cipher suite, for reporting.
pub fn negotiated(stream: &TlsStream<TcpStream>) -> (Option<String>, Option<String>) {
    let (_, connection) = stream.get_ref();
    let version = connection.protocol_version().map(|v| format!("{v:?}"));
    let cipher = connection
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()));
    (version, cipher)
}

#[cfg(test)]
mod tests {
    use super::client_config;
    use std::sync::Arc;

    #[test]
    fn client_config_is_built_once() {
        let first = client_config().unwrap();
        let second = client_config().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
