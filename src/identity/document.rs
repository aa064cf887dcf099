use super::errors::DocumentError;
use crate::peer;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spiffe::{SpiffeId, TrustDomain};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// A workload identity: certificate chain, private key and trust bundles.
///
/// Documents are immutable. Rotation replaces the whole document; nothing is
/// mutated in place. The SPIFFE ID is taken from the first URI SAN of the leaf
/// certificate, so it always agrees with what peers will see.
#[derive(Clone)]
pub struct IdentityDocument {
    spiffe_id: SpiffeId,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Zeroizing<Vec<u8>>,
    bundles: BTreeMap<TrustDomain, Vec<CertificateDer<'static>>>,
}

impl IdentityDocument {
    /// Builds a document from a leaf-first chain, a PKCS#8 key and trust bundles.
    ///
    /// # Errors
    ///
    /// Returns a [`DocumentError`] if the chain or key is empty, the leaf has no
    /// SPIFFE ID URI, or `bundles` has no entry for the leaf's trust domain.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key_pkcs8: Vec<u8>,
        bundles: BTreeMap<TrustDomain, Vec<CertificateDer<'static>>>,
    ) -> Result<Self, DocumentError> {
        let private_key = Zeroizing::new(private_key_pkcs8);

        let leaf = cert_chain.first().ok_or(DocumentError::EmptyChain)?;
        if private_key.is_empty() {
            return Err(DocumentError::EmptyKey);
        }

        let uri = peer::identity_uri(Some(leaf))?;
        let spiffe_id =
            SpiffeId::new(&uri).map_err(|e| DocumentError::InvalidIdentity(format!("{uri}: {e}")))?;

        if !bundles
            .get(spiffe_id.trust_domain())
            .is_some_and(|roots| !roots.is_empty())
        {
            return Err(DocumentError::MissingBundle(
                spiffe_id.trust_domain().to_string(),
            ));
        }

        Ok(Self {
            spiffe_id,
            cert_chain,
            private_key,
            bundles,
        })
    }

    /// The SPIFFE ID of this workload.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // `new` rejects empty chains.
        &self.cert_chain[0]
    }

    /// The private key in PKCS#8 DER form.
    pub fn private_key_pkcs8(&self) -> &[u8] {
        &self.private_key
    }

    pub(crate) fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.to_vec()))
    }

    /// Trusted roots for `trust_domain`, if a bundle is present.
    pub fn bundle_for(&self, trust_domain: &TrustDomain) -> Option<&[CertificateDer<'static>]> {
        self.bundles.get(trust_domain).map(Vec::as_slice)
    }

    /// All trust bundles, keyed by trust domain.
    pub fn bundles(&self) -> &BTreeMap<TrustDomain, Vec<CertificateDer<'static>>> {
        &self.bundles
    }
}

impl fmt::Debug for IdentityDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityDocument")
            .field("spiffe_id", &self.spiffe_id)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("trust_domains", &self.bundles.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::TestCa;

    #[test]
    fn identity_comes_from_leaf_uri() {
        let ca = TestCa::new("example.org");
        let doc = ca.document("spiffe://example.org/workload");

        assert_eq!(doc.spiffe_id().to_string(), "spiffe://example.org/workload");
        assert_eq!(
            SpiffeId::new(&doc.spiffe_id().to_string()).unwrap(),
            *doc.spiffe_id()
        );
        assert_eq!(doc.cert_chain().len(), 1);
        assert!(!doc.private_key_pkcs8().is_empty());
        assert_eq!(
            doc.bundle_for(&TrustDomain::new("example.org").unwrap()),
            Some(&[ca.root()][..])
        );
    }

    #[test]
    fn rejects_empty_chain_and_key() {
        let ca = TestCa::new("example.org");
        let (chain, key) = ca.issue("spiffe://example.org/workload");

        assert_eq!(
            IdentityDocument::new(Vec::new(), key, ca.bundles()).unwrap_err(),
            DocumentError::EmptyChain
        );
        assert_eq!(
            IdentityDocument::new(chain, Vec::new(), ca.bundles()).unwrap_err(),
            DocumentError::EmptyKey
        );
    }

    #[test]
    fn rejects_leaf_without_spiffe_id() {
        let ca = TestCa::new("example.org");

        let (chain, key) = ca.issue_without_uri();
        assert!(matches!(
            IdentityDocument::new(chain, key, ca.bundles()),
            Err(DocumentError::Identity(_))
        ));

        let (chain, key) = ca.issue("https://example.org/workload");
        assert!(matches!(
            IdentityDocument::new(chain, key, ca.bundles()),
            Err(DocumentError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn requires_bundle_for_own_trust_domain() {
        let ca = TestCa::new("example.org");
        let (chain, key) = ca.issue("spiffe://example.org/workload");
        assert_eq!(
            IdentityDocument::new(chain, key, BTreeMap::new()).unwrap_err(),
            DocumentError::MissingBundle("example.org".into())
        );
    }

    #[test]
    fn debug_redacts_private_key() {
        let doc = TestCa::new("example.org").document("spiffe://example.org/workload");
        let rendered = format!("{doc:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("example.org"));
    }
}
