//! TLS client configuration: trust roots, optional client certificate
//! (`Credentials::Tls`), and the insecure bypass for
//! `reject_unauthorized = false`.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use secrecy::ExposeSecret;

use crate::config::{Credentials, ResolvedConfig};
use crate::error::ConfigError;

static CRYPTO_PROVIDER: OnceCell<()> = OnceCell::new();

fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any server certificate, for `reject_unauthorized = false`. Named
/// after its purpose rather than decorated with a justification — callers
/// who reach for this already know why.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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

fn parse_cert_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("failed to parse certificate chain: {e}")))
}

fn parse_private_key(
    pem: &[u8],
) -> Result<rustls_pki_types::PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut std::io::Cursor::new(pem))
        .map_err(|e| ConfigError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ConfigError::Tls("no private key found in PEM input".to_string()))
}

pub fn build_client_config(resolved: &ResolvedConfig) -> Result<Arc<rustls::ClientConfig>, ConfigError> {
    ensure_crypto_provider_installed();

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

    let mut config = match &resolved.credentials {
        Credentials::Tls { cert, key, .. } => {
            let chain = parse_cert_chain(cert)?;
            let key = parse_private_key(key.expose_secret().as_bytes())?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| ConfigError::Tls(format!("invalid client certificate: {e}")))?
        }
        Credentials::Token { .. } => builder.with_no_client_auth(),
    };

    if !resolved.reject_unauthorized {
        let provider = config.crypto_provider().clone();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));
    }

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}
