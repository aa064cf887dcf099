//! Peer identity extraction from X.509 certificates.
//!
//! The identity of a workload is the first URI subject alternative name of its
//! leaf certificate. Extraction returns that URI exactly as encoded and never
//! canonicalizes it, so it can be used both for logging and for policy decisions.

use rustls::pki_types::CertificateDer;
use spiffe::SpiffeId;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

/// Errors returned while extracting an identity from a certificate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdentityError {
    /// No certificate was supplied, or the peer presented an empty chain.
    #[error("certificate is absent")]
    EmptyCertificate,

    /// The certificate carries no URI subject alternative name.
    #[error("certificate has no identity URI")]
    NoIdentityUri,

    /// The certificate bytes are not a valid X.509 certificate.
    #[error("failed parsing certificate: {0}")]
    CertParse(String),
}

/// Returns the first URI SAN of `cert`, verbatim.
///
/// # Errors
///
/// * [`PeerIdentityError::EmptyCertificate`] if `cert` is `None` or holds no bytes.
/// * [`PeerIdentityError::NoIdentityUri`] if the certificate has no URI SAN.
/// * [`PeerIdentityError::CertParse`] if the DER cannot be parsed.
pub fn identity_uri(cert: Option<&CertificateDer<'_>>) -> Result<String, PeerIdentityError> {
    let der = match cert {
        Some(cert) if !cert.as_ref().is_empty() => cert.as_ref(),
        _ => return Err(PeerIdentityError::EmptyCertificate),
    };

    let (_, parsed) = X509Certificate::from_der(der)
        .map_err(|e| PeerIdentityError::CertParse(e.to_string()))?;

    let san = parsed
        .subject_alternative_name()
        .map_err(|e| PeerIdentityError::CertParse(e.to_string()))?
        .ok_or(PeerIdentityError::NoIdentityUri)?;

    san.value
        .general_names
        .iter()
        .find_map(|name| match name {
            GeneralName::URI(uri) => Some((*uri).to_owned()),
            _ => None,
        })
        .ok_or(PeerIdentityError::NoIdentityUri)
}

/// Returns the identity URI of the leaf (first) certificate of a peer chain.
///
/// # Errors
///
/// Returns [`PeerIdentityError::EmptyCertificate`] if the chain is absent or
/// empty, otherwise the errors of [`identity_uri`].
pub fn peer_identity_uri(
    peer_certs: Option<&[CertificateDer<'_>]>,
) -> Result<String, PeerIdentityError> {
    identity_uri(peer_certs.and_then(<[_]>::first))
}

/// Identity of the remote end of an established mTLS connection.
///
/// `uri` is `None` only when the peer certificate had no identity URI, which the
/// verifiers of this crate never let through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    uri: Option<String>,
}

impl PeerIdentity {
    /// Creates a new `PeerIdentity`.
    pub fn new(uri: Option<String>) -> Self {
        Self { uri }
    }

    /// The peer's identity URI, if present.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// The peer's identity parsed as a SPIFFE ID.
    pub fn spiffe_id(&self) -> Option<SpiffeId> {
        self.uri.as_deref().and_then(|uri| SpiffeId::new(uri).ok())
    }

    /// Extracts the identity from the certificates a rustls connection recorded.
    ///
    /// A missing identity URI yields `uri: None`; an unparsable certificate is
    /// an error.
    pub(crate) fn from_peer_certificates(
        peer_certs: Option<&[CertificateDer<'_>]>,
    ) -> Result<Self, PeerIdentityError> {
        match peer_identity_uri(peer_certs) {
            Ok(uri) => Ok(Self::new(Some(uri))),
            Err(PeerIdentityError::EmptyCertificate | PeerIdentityError::NoIdentityUri) => {
                Ok(Self::new(None))
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.uri.as_deref().unwrap_or("<none>"))
    }
}
