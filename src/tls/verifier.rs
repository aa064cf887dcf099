//! rustls verifiers that authenticate with SPIFFE trust bundles and authorize
//! with an [`AuthorizationPolicy`].
//!
//! Both verifiers follow the same steps: read the identity URI of the leaf,
//! pick the roots of its trust domain, verify the chain, and only then ask the
//! policy. Server names are never checked; the identity URI is what counts.

use super::material::MaterialSnapshot;
use super::watcher::MaterialProvider;
use crate::crypto;
use crate::error::{Error, Result};
use crate::peer;
use crate::policy::{parse_identity, AuthorizationPolicy};
use crate::prelude::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use spiffe::SpiffeId;
use std::fmt;
use std::sync::Arc;

fn other_err<E>(e: E) -> rustls::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rustls::Error::Other(rustls::OtherError(Arc::new(e)))
}

/// Reads the leaf identity: the URI verbatim plus its parsed SPIFFE ID.
fn leaf_identity(leaf: &CertificateDer<'_>) -> Result<(String, SpiffeId)> {
    let uri = peer::identity_uri(Some(leaf))?;
    let spiffe_id = parse_identity(&uri)?;
    Ok((uri, spiffe_id))
}

fn authorize(
    policy: &dyn AuthorizationPolicy,
    uri: String,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Result<()> {
    let mut chain = Vec::with_capacity(1 + intermediates.len());
    chain.push(end_entity.clone());
    chain.extend(intermediates.iter().cloned());

    if policy.evaluate(&uri, &chain).is_accept() {
        debug!("peer authorized: {uri}");
        Ok(())
    } else {
        Err(Error::Unauthorized(uri))
    }
}

fn algorithms() -> std::result::Result<WebPkiSupportedAlgorithms, rustls::Error> {
    crypto::signature_algorithms()
        .ok_or_else(|| other_err(Error::Internal("rustls crypto provider is not installed".into())))
}

fn supported_schemes() -> Vec<SignatureScheme> {
    crypto::signature_algorithms()
        .map(|algs| algs.supported_schemes())
        .unwrap_or_default()
}

fn verify_signature_tls12(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &algorithms()?)
}

fn verify_signature_tls13(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &algorithms()?)
}

// ------------ Server verifier (client side) ------------

#[derive(Clone)]
pub(crate) struct SpiffeServerCertVerifier {
    provider: Arc<dyn MaterialProvider>,
    policy: Arc<dyn AuthorizationPolicy>,
}

impl fmt::Debug for SpiffeServerCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeServerCertVerifier")
            .field("provider", &"<MaterialProvider>")
            .field("policy", &"<AuthorizationPolicy>")
            .finish()
    }
}

impl SpiffeServerCertVerifier {
    pub(crate) fn new(
        provider: Arc<dyn MaterialProvider>,
        policy: Arc<dyn AuthorizationPolicy>,
    ) -> Self {
        Self { provider, policy }
    }

    fn verify_chain(
        snapshot: &MaterialSnapshot,
        spiffe_id: &SpiffeId,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<(), rustls::Error> {
        let trust_domain = spiffe_id.trust_domain();
        let roots = snapshot
            .roots_by_td
            .get(trust_domain)
            .ok_or_else(|| other_err(Error::NoBundle(trust_domain.to_string())))?;

        let algs = algorithms()?;
        let parsed = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            roots,
            intermediates,
            now,
            algs.all,
        )
    }
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let (uri, spiffe_id) = leaf_identity(end_entity).map_err(other_err)?;

        let snapshot = self.provider.current_material();
        Self::verify_chain(&snapshot, &spiffe_id, end_entity, intermediates, now)?;

        authorize(&*self.policy, uri, end_entity, intermediates).map_err(other_err)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

// ------------ Client verifier (server side) ------------

#[derive(Clone)]
pub(crate) struct SpiffeClientCertVerifier {
    provider: Arc<dyn MaterialProvider>,
    policy: Arc<dyn AuthorizationPolicy>,
}

impl fmt::Debug for SpiffeClientCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeClientCertVerifier")
            .field("provider", &"<MaterialProvider>")
            .field("policy", &"<AuthorizationPolicy>")
            .finish()
    }
}

impl SpiffeClientCertVerifier {
    pub(crate) fn new(
        provider: Arc<dyn MaterialProvider>,
        policy: Arc<dyn AuthorizationPolicy>,
    ) -> Self {
        Self { provider, policy }
    }
}

impl ClientCertVerifier for SpiffeClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let (uri, spiffe_id) = leaf_identity(end_entity).map_err(other_err)?;

        let snapshot = self.provider.current_material();
        let trust_domain = spiffe_id.trust_domain();
        let inner = snapshot
            .client_verifiers
            .get(trust_domain)
            .ok_or_else(|| other_err(Error::NoBundle(trust_domain.to_string())))?;

        let ok = inner.verify_client_cert(end_entity, intermediates, now)?;

        authorize(&*self.policy, uri, end_entity, intermediates).map_err(other_err)?;
        Ok(ok)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}
