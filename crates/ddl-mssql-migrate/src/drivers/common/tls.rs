//! TLS for PostgreSQL source connections.
//!
//! `sslmode` follows libpq naming. A client configuration that cannot be
//! built is an environment failure, never a retryable connect failure.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::connection::ConnectFailure;
use crate::error::{MigrateError, Result};

/// PostgreSQL `sslmode`. `allow` and `prefer` are treated as `disable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    /// Encrypt without verifying the server certificate.
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "disable" | "allow" | "prefer" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(MigrateError::Config(format!(
                "unknown sslmode '{}' (expected disable, require, verify-ca or verify-full)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

/// Connector for `tokio_postgres::Config::connect`, or `None` for plain TCP.
pub fn pg_connector(mode: SslMode) -> std::result::Result<Option<MakeRustlsConnect>, ConnectFailure> {
    let config = match mode {
        SslMode::Disable => return Ok(None),
        SslMode::Require => {
            warn!("sslmode=require: session is encrypted but the server certificate is not checked");
            let provider = rustls::crypto::ring::default_provider();
            let schemes = provider
                .signature_verification_algorithms
                .supported_schemes();
            ClientConfig::builder_with_provider(Arc::new(provider))
                .with_safe_default_protocol_versions()
                .map_err(|e| ConnectFailure::environment(format!("TLS setup: {}", e)))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { schemes }))
                .with_no_client_auth()
        }
        // rustls always checks the host name, so verify-ca behaves like verify-full
        SslMode::VerifyCa | SslMode::VerifyFull => {
            debug!("sslmode={}: verifying against webpki roots", mode.as_str());
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    Ok(Some(MakeRustlsConnect::new(config)))
}

/// Certificate verifier for `sslmode=require`.
#[derive(Debug)]
struct AcceptAnyCert {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyCert {
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
        self.schemes.clone()
    }
}
