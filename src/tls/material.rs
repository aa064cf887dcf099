use crate::crypto;
use crate::error::{Error, Result};
use crate::identity::IdentityDocument;
use crate::prelude::debug;
use rustls::pki_types::CertificateDer;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use spiffe::{SpiffeId, TrustDomain};
use std::collections::BTreeMap;
use std::sync::Arc;

/// rustls view of one identity document.
///
/// Rebuilt from scratch on every rotation; handshakes in flight keep the
/// snapshot they started with.
#[derive(Clone, Debug)]
pub(crate) struct MaterialSnapshot {
    pub generation: u64,
    pub spiffe_id: SpiffeId,
    pub certified_key: Arc<CertifiedKey>,
    pub roots_by_td: BTreeMap<TrustDomain, Arc<RootCertStore>>,
    pub client_verifiers: BTreeMap<TrustDomain, Arc<dyn ClientCertVerifier>>,
}

impl MaterialSnapshot {
    /// Builds the signing key, root stores and client verifiers for `document`.
    ///
    /// ## Errors
    ///
    /// Returns [`Error::CertifiedKey`] if the key cannot be loaded,
    /// [`Error::NoBundle`] if a bundle holds no usable root and
    /// [`Error::VerifierBuilder`] if a client verifier cannot be built.
    pub(crate) fn from_document(document: &IdentityDocument, generation: u64) -> Result<Self> {
        let provider = crypto::default_provider()
            .ok_or_else(|| Error::CertifiedKey("rustls crypto provider is not installed".into()))?;

        let signing_key = provider
            .key_provider
            .load_private_key(document.private_key_der())
            .map_err(|e| Error::CertifiedKey(format!("{e:?}")))?;
        let certified_key = Arc::new(CertifiedKey::new(
            document.cert_chain().to_vec(),
            signing_key,
        ));

        let mut roots_by_td = BTreeMap::new();
        let mut client_verifiers = BTreeMap::new();
        for (trust_domain, certs) in document.bundles() {
            let roots = roots_from_certs(trust_domain, certs)?;
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&provider))
                    .build()
                    .map_err(|e| Error::VerifierBuilder(format!("{e:?}")))?;

            client_verifiers.insert(trust_domain.clone(), verifier);
            roots_by_td.insert(trust_domain.clone(), roots);
        }

        Ok(Self {
            generation,
            spiffe_id: document.spiffe_id().clone(),
            certified_key,
            roots_by_td,
            client_verifiers,
        })
    }
}

/// Build a `RootCertStore` from the DER authorities of one trust domain.
fn roots_from_certs(
    trust_domain: &TrustDomain,
    certs: &[CertificateDer<'static>],
) -> Result<Arc<RootCertStore>> {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());

    debug!("loaded root cert(s) for {trust_domain}: added={added}, ignored={ignored}");

    if store.is_empty() {
        return Err(Error::NoBundle(trust_domain.to_string()));
    }
    Ok(Arc::new(store))
}
