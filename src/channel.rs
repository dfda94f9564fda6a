// Jackson Coxson
// Devices serve self-issued certificates, so there is nothing meaningful to
// verify on our side. See https://github.com/rustls/rustls/issues/578

use std::sync::Arc;

use rustls::{
    ClientConfig, DigitallySignedStruct,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use tracing::debug;

use crate::{Idevice, IdeviceError, cancel, pairing_file::PairingFile};

#[cfg(not(any(feature = "ring", feature = "aws-lc")))]
compile_error!("enable either the `ring` or the `aws-lc` feature");

/// Whether a channel has been upgraded to TLS
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    Plain,
    Encrypted,
}

/// A verifier that accepts whatever certificate the device presents
#[derive(Debug)]
pub struct NoServerNameVerification {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoServerNameVerification {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

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
        self.schemes.clone()
    }
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc", not(feature = "ring")))]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

/// Builds the client config presenting the host identity from the pair record
pub fn create_client_config(pairing_file: &PairingFile) -> Result<ClientConfig, IdeviceError> {
    let provider = Arc::new(crypto_provider());
    let verifier = NoServerNameVerification::new(&provider);

    let host_certificate = CertificateDer::from_pem_slice(&pairing_file.host_certificate)?;
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![host_certificate], private_key)?;

    // Lockdown drops resumed sessions
    config.resumption = rustls::client::Resumption::disabled();

    Ok(config)
}

impl Idevice {
    /// Upgrades the connection to TLS using the pair record's host identity
    ///
    /// Nothing may be buffered at this point: plaintext that arrived before the
    /// upgrade belongs to neither side of the boundary.
    ///
    /// # Errors
    /// `ProtocolError` if unread plaintext is pending or the channel is already
    /// encrypted, otherwise whatever the handshake fails with
    pub async fn start_session(&mut self, pairing_file: &PairingFile) -> Result<(), IdeviceError> {
        if self.mode == ChannelMode::Encrypted {
            return Err(IdeviceError::ProtocolError(
                "channel is already encrypted".into(),
            ));
        }
        if !self.frames.is_empty() {
            return Err(IdeviceError::ProtocolError(format!(
                "{} bytes of plaintext pending at TLS upgrade",
                self.frames.len()
            )));
        }

        let config = create_client_config(pairing_file)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let domain = ServerName::try_from("Device")
            .map_err(|e| IdeviceError::InternalError(e.to_string()))?;

        let socket = self
            .socket
            .take()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        debug!("Upgrading {} to TLS", self.label);
        let socket = cancel::guard(&mut self.cancel, Some(self.timeout), async {
            connector
                .connect(domain, socket)
                .await
                .map_err(IdeviceError::from_socket_io)
        })
        .await?;

        self.socket = Some(Box::new(socket));
        self.mode = ChannelMode::Encrypted;
        Ok(())
    }
}
