//! Server identity verification pinned to one database instance.
//!
//! The server presents a certificate chained to a per-instance CA delivered
//! out of band in the metadata snapshot, so trust roots come from the
//! snapshot rather than the system store. Identity is checked two ways:
//! modern server certificates carry the instance DNS name in the SAN
//! extension and verify like any hostname, while legacy certificates carry
//! `PROJECT:INSTANCE` in the subject Common Name, which no stock verifier
//! will accept. The verifier here runs the standard webpki validation and
//! falls back to the CN comparison only when the name check was the sole
//! failure.

use crate::instance::ConnectionInfo;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

/// A `ServerCertVerifier` that accepts either a SAN match or the legacy
/// `PROJECT:INSTANCE` Common Name.
#[derive(Debug)]
pub struct InstanceIdentityVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected_common_name: String,
}

impl InstanceIdentityVerifier {
    /// Build a verifier trusting `roots` (the instance CA certificates) and
    /// accepting `expected_common_name` in legacy certificates.
    pub fn new(roots: RootCertStore, expected_common_name: String) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Trust(format!("unable to build certificate verifier: {}", e)))?;
        Ok(Self {
            inner,
            expected_common_name,
        })
    }

    /// Compare the certificate's subject CN against the expected instance
    /// identity. When the subject carries several CN attributes the last one
    /// wins, matching how the legacy server certificates are laid out.
    fn check_common_name(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref()).map_err(|e| {
            rustls::Error::General(format!("unable to parse server certificate: {}", e))
        })?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .last()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| {
                rustls::Error::General(
                    "server certificate subject has no common name".to_string(),
                )
            })?;
        if common_name == self.expected_common_name {
            Ok(())
        } else {
            Err(rustls::Error::General(format!(
                "server certificate common name \"{}\" does not match expected \"{}\"",
                common_name, self.expected_common_name
            )))
        }
    }
}

impl ServerCertVerifier for InstanceIdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            // Name verification runs last in the webpki verifier, so this
            // failure means the chain itself was valid and only the SAN did
            // not match; legacy certificates get the CN comparison instead.
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => {
                self.check_common_name(end_entity)?;
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Assemble the client TLS configuration for one connection attempt from the
/// current credential snapshot: trust roots and expected identity from the
/// metadata, client certificate and key from the ephemeral TLS material.
pub fn client_tls_config(info: &ConnectionInfo) -> Result<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in info.metadata().server_ca_certs() {
        roots
            .add(cert.clone())
            .map_err(|e| Error::Trust(format!("invalid server CA certificate: {}", e)))?;
    }
    let verifier = InstanceIdentityVerifier::new(
        roots,
        info.metadata().instance_name().expected_common_name(),
    )?;
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(
            info.tls_material().client_cert_chain.clone(),
            info.tls_material().client_key.clone_key(),
        )?;
    Ok(config)
}
