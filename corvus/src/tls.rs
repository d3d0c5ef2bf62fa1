//! Rustls client configuration assembly and the post-INFO upgrade.
//!
//! TLS is never started speculatively: the caller waits for the
//! server's INFO frame first so `tls_required` and the SNI name are
//! known before the handshake.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ConnectionError, Error, Result};
use crate::options::TlsOptions;

fn config_err(reason: impl Into<String>) -> Error {
    Error::Connection(ConnectionError::TlsConfigurationFailed {
        reason: reason.into(),
    })
}

fn load_pem_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| config_err(format!("reading {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| config_err(format!("parsing certificates in {}: {e}", path.display())))
}

fn load_pem_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| config_err(format!("reading {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| config_err(format!("parsing key in {}: {e}", path.display())))?
        .ok_or_else(|| config_err(format!("no private key found in {}", path.display())))
}

/// Build a rustls client config from the options. Webpki roots unless
/// a CA file is given; optional client chain for mutual TLS.
pub(crate) fn client_config(options: &TlsOptions) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    match &options.ca_file {
        Some(path) => {
            for cert in load_pem_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| config_err(format!("adding root from {}: {e}", path.display())))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (&options.cert_file, &options.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_pem_certs(cert_path)?;
            let key = load_pem_key(key_path)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| config_err(format!("client certificate rejected: {e}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(config_err(
                "client cert and key must be provided together",
            ))
        }
    };

    if !options.verify_enabled() {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(verifier::NoVerification::default()));
    }
    Ok(config)
}

/// Upgrade an established TCP stream to TLS.
pub(crate) async fn upgrade(
    options: &TlsOptions,
    host: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let config = client_config(options)?;
    let connector = TlsConnector::from(Arc::new(config));
    let sni = options.sni_hostname.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(sni.to_owned())
        .map_err(|_| config_err(format!("invalid SNI hostname '{sni}'")))?;
    debug!(host, sni, "starting tls handshake");
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| {
            Error::Connection(ConnectionError::TlsHandshakeFailed {
                reason: e.to_string(),
            })
        })
}

mod verifier {
    //! Verification bypass for test setups with self-signed servers.

    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub(crate) struct NoVerification {
        provider: std::sync::Arc<tokio_rustls::rustls::crypto::CryptoProvider>,
    }

    impl Default for NoVerification {
        fn default() -> Self {
            Self {
                provider: tokio_rustls::rustls::crypto::CryptoProvider::get_default()
                    .cloned()
                    .unwrap_or_else(|| {
                        std::sync::Arc::new(tokio_rustls::rustls::crypto::ring::default_provider())
                    }),
            }
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
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
        ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
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
}
