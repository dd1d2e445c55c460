//! Server certificate verification pinned to a single CA.
//!
//! The broker's chain must build to the pinned CA, and the chain root's
//! SHA-256 thumbprint must equal the pinned CA's thumbprint. The pinned CA
//! does not need to be in any system store. Revocation is not checked.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::PkiError;
use crate::thumbprint::Thumbprint;

/// Verifies broker certificates against one pinned CA.
#[derive(Debug)]
pub struct PinnedCaVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pinned: Thumbprint,
    pinned_subject: Vec<u8>,
}

impl PinnedCaVerifier {
    /// Build a verifier that trusts only `ca`.
    pub fn new(ca: CertificateDer<'static>) -> Result<Self, PkiError> {
        let (_, parsed) = x509_parser::parse_x509_certificate(&ca)
            .map_err(|e| PkiError::InvalidCertificate(format!("pinned CA: {e}")))?;
        let pinned_subject = parsed.subject().as_raw().to_vec();
        let pinned = Thumbprint::of(&ca);

        let mut roots = RootCertStore::empty();
        roots
            .add(ca)
            .map_err(|e| PkiError::InvalidCertificate(format!("pinned CA: {e}")))?;
        let inner = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(rustls::crypto::ring::default_provider()),
        )
        .build()
        .map_err(|e| PkiError::Verifier(e.to_string()))?;

        Ok(Self {
            inner,
            pinned,
            pinned_subject,
        })
    }

    pub const fn pinned_thumbprint(&self) -> Thumbprint {
        self.pinned
    }

    // The last presented certificate is either the root itself (servers may
    // send it) or the certificate directly under the trust anchor.
    fn chain_root(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<Thumbprint, rustls::Error> {
        let top = intermediates.last().unwrap_or(end_entity);
        let (_, cert) = x509_parser::parse_x509_certificate(top)
            .map_err(|e| rustls::Error::General(format!("unparsable certificate: {e}")))?;

        let subject = cert.subject().as_raw();
        let issuer = cert.issuer().as_raw();
        if subject == issuer {
            Ok(Thumbprint::of(top))
        } else if issuer == self.pinned_subject.as_slice() {
            Ok(self.pinned)
        } else {
            Err(rustls::Error::General(
                "certificate chain does not end at the pinned CA".into(),
            ))
        }
    }
}

impl ServerCertVerifier for PinnedCaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let root = self.chain_root(end_entity, intermediates)?;
        if root != self.pinned {
            tracing::warn!(
                expected = %self.pinned,
                actual = %root,
                "Broker chain root thumbprint mismatch"
            );
            return Err(rustls::Error::General(
                "chain root thumbprint does not match pinned CA".into(),
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
