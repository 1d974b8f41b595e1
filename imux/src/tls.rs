// TLS configuration for device sessions
//
// Devices present self-signed certificates issued from the pair record root, so the
// client side cannot validate them against any store. The server side is used when
// standing in for a device and presents the host half of the pair record.

use rustls::{
    ClientConfig, DigitallySignedStruct, ServerConfig,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::{ImuxError, pairing_file::PairingFile};

/// Accepts whatever certificate the device presents
#[derive(Debug)]
pub struct NoServerNameVerification;

impl ServerCertVerifier for NoServerNameVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Installs the process-wide crypto provider if nothing has yet
pub(crate) fn ensure_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }
    #[cfg(feature = "aws-lc")]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
    let provider = rustls::crypto::ring::default_provider();

    // A concurrent install wins the race; that is fine, only log it
    if let Err(e) = CryptoProvider::install_default(provider) {
        error!("Failed to set crypto provider: {e:?}");
    }
}

pub fn create_client_config(pairing_file: &PairingFile) -> Result<ClientConfig, ImuxError> {
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoServerNameVerification))
        .with_client_auth_cert(vec![pairing_file.host_certificate.clone()], private_key)?;
    config.resumption = rustls::client::Resumption::disabled();

    debug!("Created TLS client config");
    Ok(config)
}

pub fn create_server_config(pairing_file: &PairingFile) -> Result<ServerConfig, ImuxError> {
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![pairing_file.host_certificate.clone()], private_key)?;
    // Tickets would arrive after a handshake-only session has gone back to plaintext
    config.send_tls13_tickets = 0;

    debug!("Created TLS server config");
    Ok(config)
}
