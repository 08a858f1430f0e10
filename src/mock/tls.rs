//! Ephemeral TLS material for TLS-enabled mocks.
//!
//! Generates an in-memory CA and a `localhost` server certificate signed
//! by it. The CA PEM is what instances bundle into the aggregator's
//! `oauth.mcpClient.caFile` so self-signed mocks verify.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, Issuer,
    KeyPair,
};

use crate::error::OAuthError;

/// Generated CA and server certificate PEMs.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// CA certificate, PEM.
    pub ca_cert_pem: String,
    /// Server certificate (signed by the CA), PEM.
    pub server_cert_pem: String,
    /// Server private key, PEM.
    pub server_key_pem: String,
}

impl TlsMaterial {
    /// Generates a fresh CA and a `localhost`/`127.0.0.1` server cert.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::KeyGeneration`] if certificate generation
    /// fails.
    pub fn generate(common_name: &str) -> Result<Self, OAuthError> {
        let key_gen = |e: rcgen::Error| OAuthError::KeyGeneration(e.to_string());

        let ca_key = KeyPair::generate().map_err(key_gen)?;
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = distinguished_name(&format!("{common_name} test CA"));
        let ca_cert = ca_params.self_signed(&ca_key).map_err(key_gen)?;
        let ca_cert_pem = ca_cert.pem();
        let issuer = Issuer::new(ca_params, ca_key);

        let (server_cert, server_key) = server_cert(common_name, &issuer)?;

        Ok(Self {
            ca_cert_pem,
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
        })
    }

    /// Builds the rustls config used by `axum-server`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::StartFailed`] if the PEM material is rejected.
    pub async fn rustls_config(
        &self,
    ) -> Result<axum_server::tls_rustls::RustlsConfig, OAuthError> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        axum_server::tls_rustls::RustlsConfig::from_pem(
            self.server_cert_pem.clone().into_bytes(),
            self.server_key_pem.clone().into_bytes(),
        )
        .await
        .map_err(|e| OAuthError::StartFailed(format!("tls config rejected: {e}")))
    }
}

fn server_cert(
    common_name: &str,
    issuer: &Issuer<'_, KeyPair>,
) -> Result<(Certificate, KeyPair), OAuthError> {
    let key_gen = |e: rcgen::Error| OAuthError::KeyGeneration(e.to_string());
    let key = KeyPair::generate().map_err(key_gen)?;
    let mut params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .map_err(key_gen)?;
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::NoCa;
    let cert = params.signed_by(&key, issuer).map_err(key_gen)?;
    Ok((cert, key))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}
